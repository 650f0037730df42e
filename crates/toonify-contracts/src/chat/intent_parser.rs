use std::collections::BTreeMap;

use serde_json::Value;

use super::command_registry::{
    CommandSpec, NO_ARG_COMMANDS, RAW_ARG_COMMANDS, SINGLE_PATH_COMMANDS,
};

#[derive(Debug, Clone, PartialEq)]
pub struct Intent {
    pub action: String,
    pub raw: String,
    pub command_args: BTreeMap<String, Value>,
}

impl Intent {
    fn new(action: &str, raw: &str) -> Self {
        Self {
            action: action.to_string(),
            raw: raw.to_string(),
            command_args: BTreeMap::new(),
        }
    }

    pub fn arg_str(&self, key: &str) -> Option<&str> {
        self.command_args
            .get(key)
            .and_then(Value::as_str)
            .map(str::trim)
            .filter(|value| !value.is_empty())
    }
}

fn find_action(command: &str, specs: &[CommandSpec]) -> Option<&'static str> {
    specs
        .iter()
        .find(|spec| spec.command == command)
        .map(|spec| spec.action)
}

fn parse_single_path_arg(arg: &str) -> String {
    if arg.trim().is_empty() {
        return String::new();
    }
    match shell_words::split(arg) {
        Ok(parts) => parts
            .into_iter()
            .filter(|value| !value.is_empty())
            .collect::<Vec<String>>()
            .join(" "),
        Err(_) => arg.trim().to_string(),
    }
}

/// Parses one line typed into an interactive session.
///
/// Text without a leading `/` is taken as an image path, which is what a
/// terminal produces when a file is dropped onto it.
pub fn parse_intent(text: &str) -> Intent {
    let raw_trimmed = text.trim();
    if raw_trimmed.is_empty() {
        return Intent::new("noop", text);
    }

    if let Some(slash_tail) = raw_trimmed.strip_prefix('/') {
        let command_len = slash_tail
            .chars()
            .take_while(|ch| ch.is_ascii_alphanumeric() || *ch == '_')
            .count();
        let remainder = &slash_tail[command_len..];
        // `/save/me.png` or `/open.jpg` is a dropped absolute path, not a command.
        let names_a_path = remainder.starts_with(['/', '.']);
        if command_len > 0 && !names_a_path {
            let command = slash_tail[..command_len].to_ascii_lowercase();
            let arg = remainder.trim();

            if let Some(action) = find_action(&command, RAW_ARG_COMMANDS) {
                let key = if action == "set_style" { "style" } else { "model" };
                let mut intent = Intent::new(action, text);
                intent
                    .command_args
                    .insert(key.to_string(), Value::String(arg.to_string()));
                return intent;
            }

            if let Some(action) = find_action(&command, SINGLE_PATH_COMMANDS) {
                let mut intent = Intent::new(action, text);
                intent.command_args.insert(
                    "path".to_string(),
                    Value::String(parse_single_path_arg(arg)),
                );
                return intent;
            }

            if let Some(action) = find_action(&command, NO_ARG_COMMANDS) {
                return Intent::new(action, text);
            }

            let mut intent = Intent::new("unknown", text);
            intent
                .command_args
                .insert("command".to_string(), Value::String(command));
            intent
                .command_args
                .insert("arg".to_string(), Value::String(arg.to_string()));
            return intent;
        }
    }

    let mut intent = Intent::new("select_image", text);
    intent.command_args.insert(
        "path".to_string(),
        Value::String(parse_single_path_arg(raw_trimmed)),
    );
    intent
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::parse_intent;

    #[test]
    fn parse_open_with_quoted_path() {
        let intent = parse_intent("/open \"/tmp/my photo.png\"");
        assert_eq!(intent.action, "select_image");
        assert_eq!(intent.command_args["path"], json!("/tmp/my photo.png"));
    }

    #[test]
    fn bare_text_is_a_dropped_path() {
        let intent = parse_intent("  '/Users/me/Desktop/selfie 2.jpg'  ");
        assert_eq!(intent.action, "select_image");
        assert_eq!(intent.arg_str("path"), Some("/Users/me/Desktop/selfie 2.jpg"));
    }

    #[test]
    fn absolute_paths_are_not_commands() {
        let nested = parse_intent("/tmp/shots/me.png");
        assert_eq!(nested.action, "select_image");
        assert_eq!(nested.arg_str("path"), Some("/tmp/shots/me.png"));

        let root_file = parse_intent("/photo.webp");
        assert_eq!(root_file.action, "select_image");
        assert_eq!(root_file.arg_str("path"), Some("/photo.webp"));
    }

    #[test]
    fn paths_under_command_named_directories_are_selected() {
        for raw in ["/save/me.png", "/style/x.png", "/open.jpg", "/generate/out/portrait.webp"] {
            let intent = parse_intent(raw);
            assert_eq!(intent.action, "select_image", "{raw}");
            assert_eq!(intent.arg_str("path"), Some(raw));
        }

        let save_into = parse_intent("/save /tmp/out.png");
        assert_eq!(save_into.action, "export");
        assert_eq!(save_into.arg_str("path"), Some("/tmp/out.png"));
    }

    #[test]
    fn parse_style_and_model_commands() {
        let style = parse_intent("/style Anime / Manga");
        assert_eq!(style.action, "set_style");
        assert_eq!(style.command_args["style"], json!("Anime / Manga"));

        let model = parse_intent("/MODEL dryrun-image-1");
        assert_eq!(model.action, "set_image_model");
        assert_eq!(model.arg_str("model"), Some("dryrun-image-1"));
    }

    #[test]
    fn save_path_is_optional() {
        let intent = parse_intent("/save");
        assert_eq!(intent.action, "export");
        assert_eq!(intent.arg_str("path"), None);
    }

    #[test]
    fn parse_no_arg_commands() {
        assert_eq!(parse_intent("/generate").action, "generate");
        assert_eq!(parse_intent("/clear").action, "clear_image");
        assert_eq!(parse_intent("/styles").action, "list_styles");
        assert_eq!(parse_intent("/exit").action, "quit");
        assert_eq!(parse_intent("   ").action, "noop");
    }

    #[test]
    fn parse_unknown_command() {
        let intent = parse_intent("/magic foo bar");
        assert_eq!(intent.action, "unknown");
        assert_eq!(intent.command_args["command"], json!("magic"));
        assert_eq!(intent.command_args["arg"], json!("foo bar"));
    }
}
