//! Parsing of REPL input lines.

use std::path::PathBuf;
use unichat_core::protocol::Language;

/// One line of user input, interpreted.
#[derive(Debug, Clone, PartialEq)]
pub enum Command {
    /// Plain text: a new chat turn.
    Ask(String),
    /// Queue an image for the next turn.
    Image(PathBuf),
    Lang(Language),
    Regenerate,
    Sources,
    History,
    Help,
    Quit,
    Empty,
}

#[derive(Debug, thiserror::Error, PartialEq)]
pub enum CommandError {
    #[error("Unknown command: /{0}. Type /help for the list of commands.")]
    Unknown(String),
    #[error("Usage: {0}")]
    Usage(&'static str),
    #[error("{0}")]
    InvalidArgument(String),
}

pub const HELP: &str = "\
Commands:
  /image <path>   attach an image to the next question
  /lang vi|en     switch the answer language
  /regenerate     ask the last question again
  /sources        show the sources of the last answer
  /history        print the conversation so far
  /help           show this help
  /quit           leave
Press Ctrl+C while an answer is streaming to stop it.";

pub fn parse_command(line: &str) -> Result<Command, CommandError> {
    let line = line.trim();
    if line.is_empty() {
        return Ok(Command::Empty);
    }

    let Some(rest) = line.strip_prefix('/') else {
        return Ok(Command::Ask(line.to_string()));
    };

    let (name, arg) = match rest.split_once(char::is_whitespace) {
        Some((name, arg)) => (name, arg.trim()),
        None => (rest, ""),
    };

    match name.to_ascii_lowercase().as_str() {
        "image" | "img" => {
            if arg.is_empty() {
                Err(CommandError::Usage("/image <path>"))
            } else {
                Ok(Command::Image(PathBuf::from(arg)))
            }
        }
        "lang" | "language" => {
            if arg.is_empty() {
                return Err(CommandError::Usage("/lang vi|en"));
            }
            arg.parse::<Language>()
                .map(Command::Lang)
                .map_err(CommandError::InvalidArgument)
        }
        "regenerate" | "retry" => Ok(Command::Regenerate),
        "sources" => Ok(Command::Sources),
        "history" => Ok(Command::History),
        "help" | "?" => Ok(Command::Help),
        "quit" | "exit" | "q" => Ok(Command::Quit),
        other => Err(CommandError::Unknown(other.to_string())),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_plain_text_is_a_question() {
        assert_eq!(
            parse_command("  Học phí ngành CNTT là bao nhiêu?  ").unwrap(),
            Command::Ask("Học phí ngành CNTT là bao nhiêu?".to_string())
        );
    }

    #[test]
    fn test_blank_line_is_empty() {
        assert_eq!(parse_command("   ").unwrap(), Command::Empty);
    }

    #[test]
    fn test_image_keeps_path_with_spaces() {
        assert_eq!(
            parse_command("/image ./scans/bang diem.png").unwrap(),
            Command::Image(PathBuf::from("./scans/bang diem.png"))
        );
        assert_eq!(
            parse_command("/image").unwrap_err(),
            CommandError::Usage("/image <path>")
        );
    }

    #[test]
    fn test_lang_parses_language() {
        assert_eq!(parse_command("/lang en").unwrap(), Command::Lang(Language::En));
        assert_eq!(parse_command("/LANG VI").unwrap(), Command::Lang(Language::Vi));
        assert!(matches!(
            parse_command("/lang de"),
            Err(CommandError::InvalidArgument(_))
        ));
    }

    #[test]
    fn test_simple_commands() {
        assert_eq!(parse_command("/regenerate").unwrap(), Command::Regenerate);
        assert_eq!(parse_command("/sources").unwrap(), Command::Sources);
        assert_eq!(parse_command("/history").unwrap(), Command::History);
        assert_eq!(parse_command("/help").unwrap(), Command::Help);
        assert_eq!(parse_command("/quit").unwrap(), Command::Quit);
        assert_eq!(parse_command("/exit").unwrap(), Command::Quit);
    }

    #[test]
    fn test_unknown_command_is_rejected() {
        let err = parse_command("/delete everything").unwrap_err();
        assert_eq!(err, CommandError::Unknown("delete".to_string()));
        assert!(err.to_string().contains("/help"));
    }
}
