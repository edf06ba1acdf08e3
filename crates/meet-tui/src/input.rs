// room-screen command parsing

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Command {
    Help,
    Quit,
    Leave,
    Mute,
    Camera,
    Share,
    Hand,
    Log,
    Who,
}

/// `None` means the line is a chat message.
pub fn parse_command(s: &str) -> Option<Command> {
    let s = s.trim();
    let rest = s.strip_prefix('/')?;
    let cmd = rest.split_whitespace().next().unwrap_or("");
    match cmd {
        "help" | "h" | "?" => Some(Command::Help),
        "quit" | "q" | "exit" => Some(Command::Quit),
        "leave" | "end" | "hangup" => Some(Command::Leave),
        "mute" | "mic" => Some(Command::Mute),
        "cam" | "camera" | "video" => Some(Command::Camera),
        "share" | "screen" => Some(Command::Share),
        "hand" | "raise" => Some(Command::Hand),
        "log" => Some(Command::Log),
        "who" | "admins" => Some(Command::Who),
        _ => Some(Command::Help),
    }
}

pub const HELP: &str =
    "/mute /cam /share /hand /who /log /leave /quit, anything else is chat";

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_toggles() {
        assert_eq!(parse_command("/mute"), Some(Command::Mute));
        assert_eq!(parse_command("/cam"), Some(Command::Camera));
        assert_eq!(parse_command("  /share "), Some(Command::Share));
        assert_eq!(parse_command("/hand"), Some(Command::Hand));
    }

    #[test]
    fn parses_variants_and_defaults() {
        assert_eq!(parse_command("/leave"), Some(Command::Leave));
        assert_eq!(parse_command("/end"), Some(Command::Leave));
        assert_eq!(parse_command("/q"), Some(Command::Quit));
        assert_eq!(parse_command("/whatever"), Some(Command::Help));
        assert_eq!(parse_command("/"), Some(Command::Help));
    }

    #[test]
    fn plain_text_is_chat() {
        assert_eq!(parse_command("hello /mute"), None);
        assert_eq!(parse_command(""), None);
    }
}
