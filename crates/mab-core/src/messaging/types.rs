use std::path::PathBuf;

/// Inline keyboard (buttons) attached to a menu message.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct InlineKeyboard {
    pub buttons: Vec<InlineButton>,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct InlineButton {
    pub label: String,
    pub callback_data: String,
}

impl InlineKeyboard {
    pub fn new(buttons: Vec<InlineButton>) -> Self {
        Self { buttons }
    }

    /// Convenience for "one button per row" layouts.
    pub fn one_per_row(entries: &[(&str, String)]) -> Self {
        let buttons = entries
            .iter()
            .map(|(label, data)| InlineButton {
                label: (*label).to_string(),
                callback_data: data.clone(),
            })
            .collect();
        Self { buttons }
    }
}

/// What a produced artifact is, which decides how the transport sends it.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ArtifactKind {
    Video,
    Audio,
    Animation,
    Photo,
    Document,
}

/// One output of an operation, ready for delivery.
#[derive(Clone, Debug)]
pub struct Artifact {
    pub path: PathBuf,
    pub caption: String,
    pub kind: ArtifactKind,
}

/// Capabilities / feature flags of a messenger implementation.
#[derive(Clone, Copy, Debug)]
pub struct MessagingCapabilities {
    pub supports_edit: bool,
    pub supports_inline_keyboards: bool,
    pub max_batch_len: usize,
    pub max_message_len: usize,
}
