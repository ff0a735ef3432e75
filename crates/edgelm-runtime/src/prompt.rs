//! Prompt template application for sessions.

use edgelm_kernel::config::SessionConfig;
use edgelm_kernel::io::InputData;

/// Where in a turn the contents sit. `Na` means templates are disabled.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum ContentType {
    First,
    Middle,
    Last,
    Na,
}

/// Wraps user contents with the session's turn delimiters. The first turn
/// additionally emits the system preamble — even when the contents are
/// empty. `Last` produces the closing/opening delimiters submitted as a
/// silent tail-prefill right before decode.
pub(crate) fn apply_prompt_templates(
    contents: Vec<InputData>,
    content_type: ContentType,
    session_config: &SessionConfig,
    is_first_turn: bool,
) -> Vec<InputData> {
    let Some(templates) = &session_config.prompt_templates else {
        return contents;
    };
    if content_type == ContentType::Na {
        return contents;
    }

    let mut templated = Vec::with_capacity(contents.len() + 2);
    match content_type {
        ContentType::First => {
            let mut prefix = String::new();
            if is_first_turn {
                prefix.push_str(&templates.system_preamble);
            }
            prefix.push_str(&templates.user_prefix);
            if !prefix.is_empty() {
                templated.push(InputData::Text(prefix));
            }
            templated.extend(non_empty(contents));
        }
        ContentType::Middle => {
            if !templates.user_prefix.is_empty() {
                templated.push(InputData::Text(templates.user_prefix.clone()));
            }
            templated.extend(non_empty(contents));
        }
        ContentType::Last => {
            templated.extend(non_empty(contents));
            let suffix = format!("{}{}", templates.user_suffix, templates.model_prefix);
            if !suffix.is_empty() {
                templated.push(InputData::Text(suffix));
            }
        }
        ContentType::Na => unreachable!(),
    }
    templated
}

fn non_empty(contents: Vec<InputData>) -> impl Iterator<Item = InputData> {
    contents.into_iter().filter(|c| match c {
        InputData::Text(t) => !t.is_empty(),
        InputData::Tokens(ids) => !ids.is_empty(),
        _ => true,
    })
}
