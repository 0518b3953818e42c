//! Declarative operation registry.
//!
//! Menu callbacks carry short stable tokens; this module maps them to a
//! closed set of operation identifiers and back. Unknown or malformed
//! tokens parse to `None` so a stale button can never dispatch a
//! different operation.

use crate::domain::MediaCategory;
use crate::messaging::types::InlineKeyboard;

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum VideoOp {
    RemoveAudio,
    ExtractAudio,
    Trim,
    Merge,
    ToGif,
    Screenshots,
    Convert,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum AudioOp {
    SlowReverb,
    Convert,
    EightD,
    Speed,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum DocOp {
    MakeArchive,
    Extract,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum UrlOp {
    Download,
    Extract,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum OperationId {
    Video(VideoOp),
    Audio(AudioOp),
    Document(DocOp),
    Url(UrlOp),
}

impl OperationId {
    pub fn category(self) -> MediaCategory {
        match self {
            OperationId::Video(_) => MediaCategory::Video,
            OperationId::Audio(_) => MediaCategory::Audio,
            OperationId::Document(_) => MediaCategory::Document,
            OperationId::Url(_) => MediaCategory::Url,
        }
    }

    pub fn spec(self) -> &'static OperationSpec {
        ALL_OPS
            .iter()
            .find(|s| s.op == self)
            .expect("every operation id is registered")
    }
}

/// How the transport should deliver the operation's output.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum DeliveryKind {
    Video,
    Audio,
    Animation,
    Document,
    /// Bounded batch of photos (transport caps a single batch; the
    /// dispatcher splits above the cap).
    PhotoBatch,
    /// Bounded batch of documents.
    DocumentBatch,
}

/// Whether an operation consumes every collected file or exactly one.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum InputArity {
    All,
    Single,
}

#[derive(Debug)]
pub struct OperationSpec {
    pub op: OperationId,
    pub label: &'static str,
    pub callback: &'static str,
    pub delivery: DeliveryKind,
    pub arity: InputArity,
}

static ALL_OPS: &[OperationSpec] = &[
    OperationSpec {
        op: OperationId::Video(VideoOp::RemoveAudio),
        label: "Audio Remover",
        callback: "video:remove_audio",
        delivery: DeliveryKind::Video,
        arity: InputArity::Single,
    },
    OperationSpec {
        op: OperationId::Video(VideoOp::ExtractAudio),
        label: "Audio Extractor",
        callback: "video:extract_audio",
        delivery: DeliveryKind::Audio,
        arity: InputArity::Single,
    },
    OperationSpec {
        op: OperationId::Video(VideoOp::Trim),
        label: "Video Trimmer",
        callback: "video:trim",
        delivery: DeliveryKind::Video,
        arity: InputArity::Single,
    },
    OperationSpec {
        op: OperationId::Video(VideoOp::Merge),
        label: "Video Merger",
        callback: "video:merge",
        delivery: DeliveryKind::Video,
        arity: InputArity::All,
    },
    OperationSpec {
        op: OperationId::Video(VideoOp::ToGif),
        label: "Video to GIF",
        callback: "video:gif",
        delivery: DeliveryKind::Animation,
        arity: InputArity::Single,
    },
    OperationSpec {
        op: OperationId::Video(VideoOp::Screenshots),
        label: "Screenshots",
        callback: "video:screens",
        delivery: DeliveryKind::PhotoBatch,
        arity: InputArity::Single,
    },
    OperationSpec {
        op: OperationId::Video(VideoOp::Convert),
        label: "Video Converter",
        callback: "video:convert",
        delivery: DeliveryKind::Video,
        arity: InputArity::Single,
    },
    OperationSpec {
        op: OperationId::Audio(AudioOp::SlowReverb),
        label: "Slow + Reverb",
        callback: "audio:slow_reverb",
        delivery: DeliveryKind::Audio,
        arity: InputArity::Single,
    },
    OperationSpec {
        op: OperationId::Audio(AudioOp::Convert),
        label: "Audio Converter",
        callback: "audio:convert",
        delivery: DeliveryKind::Audio,
        arity: InputArity::Single,
    },
    OperationSpec {
        op: OperationId::Audio(AudioOp::EightD),
        label: "8D Effect",
        callback: "audio:8d",
        delivery: DeliveryKind::Audio,
        arity: InputArity::Single,
    },
    OperationSpec {
        op: OperationId::Audio(AudioOp::Speed),
        label: "Speed Change",
        callback: "audio:speed",
        delivery: DeliveryKind::Audio,
        arity: InputArity::Single,
    },
    OperationSpec {
        op: OperationId::Document(DocOp::MakeArchive),
        label: "Make Archive",
        callback: "doc:archive",
        delivery: DeliveryKind::Document,
        arity: InputArity::All,
    },
    OperationSpec {
        op: OperationId::Document(DocOp::Extract),
        label: "Extract Archive",
        callback: "doc:extract",
        delivery: DeliveryKind::DocumentBatch,
        arity: InputArity::Single,
    },
    OperationSpec {
        op: OperationId::Url(UrlOp::Download),
        label: "Download File",
        callback: "url:download",
        delivery: DeliveryKind::Document,
        arity: InputArity::Single,
    },
    OperationSpec {
        op: OperationId::Url(UrlOp::Extract),
        label: "Extract Archive",
        callback: "url:extract",
        delivery: DeliveryKind::DocumentBatch,
        arity: InputArity::Single,
    },
];

/// Archive container formats offered by the archive flow.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum ArchiveFormat {
    Zip,
    Tar,
    TarGz,
}

impl ArchiveFormat {
    pub fn label(self) -> &'static str {
        match self {
            ArchiveFormat::Zip => "ZIP",
            ArchiveFormat::Tar => "TAR",
            ArchiveFormat::TarGz => "TAR.GZ",
        }
    }

    pub fn extension(self) -> &'static str {
        match self {
            ArchiveFormat::Zip => ".zip",
            ArchiveFormat::Tar => ".tar",
            ArchiveFormat::TarGz => ".tar.gz",
        }
    }

    fn callback(self) -> &'static str {
        match self {
            ArchiveFormat::Zip => "arch:zip",
            ArchiveFormat::Tar => "arch:tar",
            ArchiveFormat::TarGz => "arch:tar_gz",
        }
    }

    /// Only ZIP carries encryption; tar containers have none.
    pub fn supports_password(self) -> bool {
        matches!(self, ArchiveFormat::Zip)
    }
}

static ARCHIVE_FORMATS: &[ArchiveFormat] =
    &[ArchiveFormat::Zip, ArchiveFormat::Tar, ArchiveFormat::TarGz];

/// A parsed menu callback.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum CallbackAction {
    Operation(OperationId),
    ArchiveType(ArchiveFormat),
    SetPassword,
    SkipPassword,
    Done,
}

pub fn parse_callback(data: &str) -> Option<CallbackAction> {
    if let Some(spec) = ALL_OPS.iter().find(|s| s.callback == data) {
        return Some(CallbackAction::Operation(spec.op));
    }
    if let Some(fmt) = ARCHIVE_FORMATS.iter().find(|f| f.callback() == data) {
        return Some(CallbackAction::ArchiveType(*fmt));
    }
    match data {
        "pw:set" => Some(CallbackAction::SetPassword),
        "pw:skip" => Some(CallbackAction::SkipPassword),
        "done" => Some(CallbackAction::Done),
        _ => None,
    }
}

/// Operation menu for one media category.
pub fn category_menu(category: MediaCategory) -> InlineKeyboard {
    let buttons = ALL_OPS
        .iter()
        .filter(|s| s.op.category() == category)
        .map(|s| (s.label, s.callback.to_string()))
        .collect::<Vec<_>>();
    InlineKeyboard::one_per_row(&buttons)
}

/// Keyboard shown with the running-totals message while collecting files.
pub fn collecting_menu() -> InlineKeyboard {
    InlineKeyboard::one_per_row(&[
        ("📦 Make Archive", "doc:archive".to_string()),
        ("🗜 Extract Archive", "doc:extract".to_string()),
        ("✅ Done", "done".to_string()),
    ])
}

pub fn archive_type_menu() -> InlineKeyboard {
    let buttons = ARCHIVE_FORMATS
        .iter()
        .map(|f| (f.label(), f.callback().to_string()))
        .collect::<Vec<_>>();
    InlineKeyboard::one_per_row(&buttons)
}

pub fn password_menu() -> InlineKeyboard {
    InlineKeyboard::one_per_row(&[
        ("🔑 Set Password", "pw:set".to_string()),
        ("⏩ Skip Password", "pw:skip".to_string()),
    ])
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn every_operation_callback_round_trips() {
        for spec in ALL_OPS {
            let parsed = parse_callback(spec.callback);
            assert_eq!(parsed, Some(CallbackAction::Operation(spec.op)));
            // And the spec lookup is total.
            assert_eq!(spec.op.spec().callback, spec.callback);
        }
    }

    #[test]
    fn archive_formats_round_trip() {
        for fmt in ARCHIVE_FORMATS {
            assert_eq!(
                parse_callback(fmt.callback()),
                Some(CallbackAction::ArchiveType(*fmt))
            );
        }
    }

    #[test]
    fn unknown_callback_parses_to_none() {
        assert_eq!(parse_callback(""), None);
        assert_eq!(parse_callback("video:explode"), None);
        assert_eq!(parse_callback("arch:rar"), None);
        assert_eq!(parse_callback("settings_rename"), None);
    }

    #[test]
    fn category_menus_only_contain_their_category() {
        let menu = category_menu(MediaCategory::Audio);
        assert_eq!(menu.buttons.len(), 4);
        for b in &menu.buttons {
            let parsed = parse_callback(&b.callback_data).unwrap();
            match parsed {
                CallbackAction::Operation(op) => {
                    assert_eq!(op.category(), MediaCategory::Audio)
                }
                other => panic!("unexpected action in audio menu: {other:?}"),
            }
        }
    }

    #[test]
    fn only_zip_supports_password() {
        assert!(ArchiveFormat::Zip.supports_password());
        assert!(!ArchiveFormat::Tar.supports_password());
        assert!(!ArchiveFormat::TarGz.supports_password());
    }
}
