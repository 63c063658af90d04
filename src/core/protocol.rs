//! Text control messages exchanged with the device.
//!
//! Replies are parsed once, here, into [`DeviceMessage`]; the session only
//! ever matches on the tagged variants.

/// A text reply from the device.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DeviceMessage {
    /// Ready to receive binary frames.
    Ready,
    /// The upload was stored.
    Done,
    /// Acknowledgement of a `DELETE` command.
    Ok,
    /// `ERROR:<message>`
    Error(String),
    Unrecognized(String),
}

impl DeviceMessage {
    pub fn parse(text: &str) -> Self {
        match text {
            "READY" => DeviceMessage::Ready,
            "DONE" => DeviceMessage::Done,
            "OK" => DeviceMessage::Ok,
            _ => match text.strip_prefix("ERROR") {
                Some(rest) => {
                    let message = rest.strip_prefix(':').unwrap_or(rest).trim();
                    if message.is_empty() {
                        DeviceMessage::Error("unspecified device error".to_string())
                    } else {
                        DeviceMessage::Error(message.to_string())
                    }
                }
                None => DeviceMessage::Unrecognized(text.to_string()),
            },
        }
    }
}

/// `START:<filename>:<sizeBytes>:<destinationPath>`
pub fn start_command(file_name: &str, size: u64, destination: &str) -> String {
    format!("START:{}:{}:{}", file_name, size, destination)
}

/// `DELETE:<path>`
pub fn delete_command(path: &str) -> String {
    format!("DELETE:{}", path)
}

/// A parsed `START` command, as the device sees it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StartCommand {
    pub file_name: String,
    pub size: u64,
    pub destination: String,
}

impl StartCommand {
    pub fn parse(text: &str) -> Option<Self> {
        let rest = text.strip_prefix("START:")?;
        let mut parts = rest.splitn(3, ':');
        let file_name = parts.next()?.to_string();
        let size = parts.next()?.parse().ok()?;
        let destination = parts.next()?.to_string();
        if file_name.is_empty() {
            return None;
        }
        Some(Self {
            file_name,
            size,
            destination,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_replies() {
        assert_eq!(DeviceMessage::parse("READY"), DeviceMessage::Ready);
        assert_eq!(DeviceMessage::parse("DONE"), DeviceMessage::Done);
        assert_eq!(DeviceMessage::parse("OK"), DeviceMessage::Ok);
        assert_eq!(
            DeviceMessage::parse("ERROR:disk full"),
            DeviceMessage::Error("disk full".to_string())
        );
    }

    #[test]
    fn test_parse_is_exact() {
        assert_eq!(
            DeviceMessage::parse("ready"),
            DeviceMessage::Unrecognized("ready".to_string())
        );
        assert_eq!(
            DeviceMessage::parse("READY "),
            DeviceMessage::Unrecognized("READY ".to_string())
        );
    }

    #[test]
    fn test_bare_error_gets_a_reason() {
        match DeviceMessage::parse("ERROR") {
            DeviceMessage::Error(message) => assert!(!message.is_empty()),
            other => panic!("expected Error, got {:?}", other),
        }
    }

    #[test]
    fn test_start_command_round_trip() {
        let text = start_command("test.epub", 100, "/books/test.epub");
        assert_eq!(text, "START:test.epub:100:/books/test.epub");

        let parsed = StartCommand::parse(&text).unwrap();
        assert_eq!(parsed.file_name, "test.epub");
        assert_eq!(parsed.size, 100);
        assert_eq!(parsed.destination, "/books/test.epub");
    }

    #[test]
    fn test_start_command_rejects_garbage() {
        assert!(StartCommand::parse("START:a.epub:lots:/").is_none());
        assert!(StartCommand::parse("HELLO").is_none());
        assert!(StartCommand::parse("START::10:/").is_none());
    }
}
