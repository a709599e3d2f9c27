use chrono::{DateTime, Local, Offset, TimeZone};

pub const TITLE_MAX_CHARS: usize = 80;

pub const TITLE_GEN_PROMPT: &str = "
You need to generate a short title based on the first message a user begins a conversation with.
Ensure it is not more than 80 characters long.
The title should be a summary of the user's message.
Do not use quotes or colons or any special characters.
Return ONLY the title, nothing else.
";

/// Short zone label in the `GMT+8` / `GMT-3:30` / `GMT+0` style.
pub fn gmt_label<Tz: TimeZone>(now: &DateTime<Tz>) -> String {
    let seconds = now.offset().fix().local_minus_utc();
    let sign = if seconds < 0 { '-' } else { '+' };
    let minutes = seconds.abs() / 60;
    match minutes % 60 {
        0 => format!("GMT{}{}", sign, minutes / 60),
        m => format!("GMT{}{}:{:02}", sign, minutes / 60, m),
    }
}

pub fn chat_system_prompt(model_name: &str, now: DateTime<Local>) -> String {
    format!(
        r#"
You are {model_name}, a helpful and friendly AI assistant.
The current time, date, and timezone of the user is {now}.

## Available Tools

**Important: Only use each tool once per response.**

### Web Search
Search the web for up-to-date information. Only use when the answer isn't in your knowledge base.

### Code Execution
Run Python or Node.js code in an isolated sandbox.
- Supports: Python ("python") and Node.js ("nodejs")
- Max execution: 30 seconds
- Use for: calculations, data processing, testing code, demonstrating behavior

## Output Formatting
Output code blocks in markdown with language tags.
Output math as LaTeX with following instructions:

### Inline Math

Wrap inline mathematical expressions with `$$`:

```markdown
The quadratic formula is $$x = \frac{{-b \pm \sqrt{{b^2 - 4ac}}}}{{2a}}$$ for solving equations.
```

### Block Math

For display-style equations, place `$$` delimiters on separate lines:

```markdown
$$
E = mc^2
$$
```
"#,
        model_name = model_name,
        now = format!("{} {}", now.format("%Y-%m-%d %H:%M:%S"), gmt_label(&now)),
    )
}

/// Normalizes whatever the title model returned into a sidebar-safe title.
pub fn clean_title(raw: &str) -> Option<String> {
    let stripped: String = raw
        .chars()
        .filter(|c| !matches!(c, '"' | '\'' | ':' | '`' | '*' | '#'))
        .collect();
    let collapsed = stripped.split_whitespace().collect::<Vec<_>>().join(" ");
    if collapsed.is_empty() {
        return None;
    }
    Some(collapsed.chars().take(TITLE_MAX_CHARS).collect())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn system_prompt_names_model_and_renders_braces() {
        let prompt = chat_system_prompt("GPT-5.2", Local::now());
        assert!(prompt.contains("You are GPT-5.2, a helpful"));
        assert!(prompt.contains(r"\frac{-b \pm \sqrt{b^2 - 4ac}}{2a}"));
    }

    #[test]
    fn zone_label_uses_gmt_offsets() {
        use chrono::FixedOffset;
        let at = |secs: i32| {
            FixedOffset::east_opt(secs)
                .unwrap()
                .with_ymd_and_hms(2025, 6, 1, 12, 0, 0)
                .unwrap()
        };
        assert_eq!(gmt_label(&at(8 * 3600)), "GMT+8");
        assert_eq!(gmt_label(&at(-(3 * 3600 + 1800))), "GMT-3:30");
        assert_eq!(gmt_label(&at(0)), "GMT+0");
        assert_eq!(gmt_label(&at(5 * 3600 + 2700)), "GMT+5:45");

        let prompt = chat_system_prompt("GPT-5.2", Local::now());
        assert!(prompt.contains(" GMT"));
    }

    #[test]
    fn clean_title_strips_quotes_and_truncates() {
        assert_eq!(
            clean_title("  \"Rust: ownership   basics\"\n").as_deref(),
            Some("Rust ownership basics")
        );
        let long = "a".repeat(200);
        assert_eq!(clean_title(&long).unwrap().chars().count(), TITLE_MAX_CHARS);
        assert_eq!(clean_title(" \" \" "), None);
    }
}
