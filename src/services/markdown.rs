use pulldown_cmark::{CodeBlockKind, Event, Options, Parser, Tag, TagEnd};

/// Render markdown as terminal-friendly plain text: emphasis markers are
/// dropped, list items get bullets or numbers, code blocks are indented and
/// links keep their target in parentheses.
pub fn to_plain_text(input: &str) -> String {
    let options = Options::ENABLE_STRIKETHROUGH | Options::ENABLE_TABLES;
    let mut ctx = RenderContext::default();
    for event in Parser::new_ext(input, options) {
        ctx.handle_event(event);
    }
    ctx.finish()
}

/// First `max_chars` characters of the plain text, with `...` when cut.
pub fn preview(input: &str, max_chars: usize) -> String {
    let text = to_plain_text(input);
    if text.chars().count() > max_chars {
        let cut: String = text.chars().take(max_chars).collect();
        format!("{}...", cut.trim_end())
    } else {
        text
    }
}

#[derive(Default)]
struct RenderContext {
    out: String,
    // One entry per open list: the next item number for ordered lists.
    lists: Vec<Option<u64>>,
    in_code_block: bool,
    link_url: Option<String>,
}

impl RenderContext {
    fn handle_event(&mut self, event: Event) {
        match event {
            Event::Start(tag) => self.handle_start(tag),
            Event::End(tag) => self.handle_end(tag),
            Event::Text(text) => {
                if self.in_code_block {
                    for line in text.lines() {
                        self.out.push_str("    ");
                        self.out.push_str(line);
                        self.out.push('\n');
                    }
                } else {
                    self.out.push_str(&text);
                }
            }
            Event::Code(code) => self.out.push_str(&code),
            Event::SoftBreak => self.out.push(' '),
            Event::HardBreak => self.out.push('\n'),
            Event::Rule => self.block_break(),
            _ => {}
        }
    }

    fn handle_start(&mut self, tag: Tag) {
        match tag {
            Tag::Paragraph | Tag::Heading { .. } | Tag::BlockQuote(_) => {
                if self.lists.is_empty() {
                    self.block_break();
                }
            }
            Tag::CodeBlock(kind) => {
                self.block_break();
                self.in_code_block = true;
                if let CodeBlockKind::Fenced(lang) = kind {
                    if !lang.trim().is_empty() {
                        self.out.push_str(&format!("  [{}]\n", lang.trim()));
                    }
                }
            }
            Tag::List(start) => {
                if self.lists.is_empty() {
                    self.block_break();
                }
                self.lists.push(start);
            }
            Tag::Item => {
                if !self.out.is_empty() && !self.out.ends_with('\n') {
                    self.out.push('\n');
                }
                let depth = self.lists.len().saturating_sub(1);
                self.out.push_str(&"  ".repeat(depth));
                match self.lists.last_mut() {
                    Some(Some(n)) => {
                        self.out.push_str(&format!("{}. ", n));
                        *n += 1;
                    }
                    _ => self.out.push_str("• "),
                }
            }
            Tag::Link { dest_url, .. } => {
                self.link_url = Some(dest_url.to_string());
            }
            _ => {}
        }
    }

    fn handle_end(&mut self, tag: TagEnd) {
        match tag {
            TagEnd::CodeBlock => self.in_code_block = false,
            TagEnd::List(_) => {
                self.lists.pop();
            }
            TagEnd::Link => {
                if let Some(url) = self.link_url.take() {
                    if !self.out.ends_with(&url) {
                        self.out.push_str(&format!(" ({})", url));
                    }
                }
            }
            TagEnd::TableCell => self.out.push('\t'),
            TagEnd::TableRow | TagEnd::TableHead => self.out.push('\n'),
            _ => {}
        }
    }

    fn block_break(&mut self) {
        let trimmed = self.out.trim_end_matches('\n').len();
        if trimmed == 0 {
            self.out.clear();
            return;
        }
        self.out.truncate(trimmed);
        self.out.push_str("\n\n");
    }

    fn finish(self) -> String {
        self.out.trim().to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_emphasis_and_headings_are_flattened() {
        let text = to_plain_text("# Title\n\nSome **bold** and *italic* text.");
        assert_eq!(text, "Title\n\nSome bold and italic text.");
    }

    #[test]
    fn test_lists() {
        let text = to_plain_text("- one\n- two\n\n1. first\n2. second");
        assert!(text.contains("• one\n• two"));
        assert!(text.contains("1. first\n2. second"));
    }

    #[test]
    fn test_code_block_is_indented() {
        let text = to_plain_text("Run:\n\n```rust\nfn main() {}\n```");
        assert!(text.contains("[rust]"));
        assert!(text.contains("    fn main() {}"));
    }

    #[test]
    fn test_links_keep_target() {
        assert_eq!(
            to_plain_text("See [docs](https://docs.rs)"),
            "See docs (https://docs.rs)"
        );
    }

    #[test]
    fn test_preview_truncates_on_chars() {
        let body = "ש".repeat(200);
        let p = preview(&body, 150);
        assert_eq!(p.chars().count(), 153);
        assert!(p.ends_with("..."));
        assert_eq!(preview("short", 150), "short");
    }
}
