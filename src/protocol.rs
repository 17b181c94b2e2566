pub const NICKNAME_PROMPT: &str = "Please enter a nickname: ";
pub const NO_NICKNAME: &str = "No nickname provided!";

const NICK_PREFIX: &str = "/nick";
const QUIT_PREFIX: &str = "/quit";

/// One line received from an active client.
#[derive(Debug, PartialEq, Eq)]
pub enum Command<'a> {
    /// `/nick <name>`. `None` when no name followed the command.
    Nick(Option<&'a str>),
    /// Anything starting with `/quit`.
    Quit,
    /// Plain chat text, relayed verbatim.
    Msg(&'a str),
}

pub fn parse_command(line: &str) -> Command<'_> {
    if line == NICK_PREFIX {
        return Command::Nick(None);
    }

    if line.starts_with("/nick ") {
        // Everything after the first space is the name, inner spaces included.
        let name = line.splitn(2, ' ').nth(1).filter(|name| !name.is_empty());
        return Command::Nick(name);
    }

    if line.starts_with(QUIT_PREFIX) {
        return Command::Quit;
    }

    Command::Msg(line)
}

pub fn joined(nickname: &str) -> String {
    format!("{} joined the chat!", nickname)
}

pub fn renamed(old: &str, new: &str) -> String {
    format!("{} renamed themselves to {}", old, new)
}

pub fn rename_confirmed(new: &str) -> String {
    format!("Successfully changed nickname to {}", new)
}

pub fn left(nickname: &str) -> String {
    format!("{} left the chat!", nickname)
}

pub fn chat(nickname: &str, text: &str) -> String {
    format!("{}: {}", nickname, text)
}
