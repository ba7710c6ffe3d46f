//! Management command tokenizer.
//!
//! Splits an inbound line on spaces, keeping `"double quoted"` segments
//! together. The first two tokens are the command (`mcp connect`), the rest
//! are its arguments.

/// A tokenized command line.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CommandLine {
    /// At most two tokens, e.g. `["mcp", "set-default"]`.
    pub command: Vec<String>,
    pub args: Vec<String>,
}

impl CommandLine {
    /// Sub-command after the `mcp` prefix, lowercased.
    pub fn subcommand(&self) -> Option<String> {
        self.command.get(1).map(|s| s.to_lowercase())
    }
}

/// Whether an inbound message is a management command rather than a query.
pub fn is_command(message: &str) -> bool {
    message.trim_start().to_lowercase().starts_with("mcp")
}

/// Tokenize `input`. Quotes are removed; an unterminated quote runs to the
/// end of the line.
pub fn parse_command_line(input: &str) -> CommandLine {
    let mut tokens: Vec<String> = Vec::new();
    let mut current = String::new();
    let mut in_quotes = false;

    for ch in input.trim().chars() {
        match ch {
            '"' => in_quotes = !in_quotes,
            ' ' if !in_quotes => {
                if !current.is_empty() {
                    tokens.push(std::mem::take(&mut current));
                }
            }
            _ => current.push(ch),
        }
    }
    if !current.is_empty() {
        tokens.push(current);
    }

    let args = tokens.split_off(tokens.len().min(2));
    CommandLine {
        command: tokens,
        args,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_splits_command_and_args() {
        let line = parse_command_line("mcp set-default abc xyz");
        assert_eq!(line.command, vec!["mcp", "set-default"]);
        assert_eq!(line.args, vec!["abc", "xyz"]);
        assert_eq!(line.subcommand().as_deref(), Some("set-default"));
    }

    #[test]
    fn test_quoted_segments_stay_together() {
        let line = parse_command_line(r#"mcp connect files npx "/path with spaces/server.js" --ro"#);
        assert_eq!(
            line.args,
            vec!["files", "npx", "/path with spaces/server.js", "--ro"]
        );
    }

    #[test]
    fn test_repeated_spaces_and_short_lines() {
        let line = parse_command_line("  MCP    List  ");
        assert_eq!(line.command, vec!["MCP", "List"]);
        assert!(line.args.is_empty());
        assert_eq!(line.subcommand().as_deref(), Some("list"));

        let bare = parse_command_line("mcp");
        assert_eq!(bare.command, vec!["mcp"]);
        assert!(bare.subcommand().is_none());

        assert_eq!(parse_command_line(""), CommandLine::default());
    }

    #[test]
    fn test_is_command() {
        assert!(is_command("mcp list"));
        assert!(is_command("MCP connect a"));
        assert!(!is_command("what is the weather?"));
    }
}
