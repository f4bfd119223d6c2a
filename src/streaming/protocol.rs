//! Speech evaluation wire protocol types
//!
//! Outgoing frames are JSON text messages. A session sends exactly one first
//! frame, any number of continuation frames and exactly one last frame:
//!
//! | frame    | `business.cmd` | `business.aus` | `data.status` | extra                         |
//! |----------|----------------|----------------|---------------|-------------------------------|
//! | first    | `ssb`          | 1              | 0             | `common.app_id`, full business, `text` |
//! | middle   | `auw`          | 2              | 1             |                               |
//! | last     | `auw`          | 4              | 2             | empty `data.data`             |

use base64::{engine::general_purpose::STANDARD, Engine};
use serde::{Deserialize, Serialize, Serializer};

use crate::config::IseConfig;
use crate::error::IseError;

/// Audio format descriptor sent with every first frame
pub const AUDIO_FORMAT: &str = "audio/L16;rate=16000";

/// Byte-order mark the service expects in front of the reference text
const TEXT_BOM: char = '\u{FEFF}';

/// Target audio encoding for a session
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AudioEncoding {
    /// 16 kHz mono 16-bit little-endian PCM
    #[default]
    Raw,
    /// MP3 (LAME). Encoder output arrives in bursts.
    Lame,
}

impl AudioEncoding {
    /// Value of the `aue` / `encoding` fields
    pub fn as_str(&self) -> &'static str {
        match self {
            AudioEncoding::Raw => "raw",
            AudioEncoding::Lame => "lame",
        }
    }

    /// Compressed encodings may starve the queue while capture is still running.
    pub fn is_compressed(&self) -> bool {
        matches!(self, AudioEncoding::Lame)
    }
}

/// Position of a frame within the session
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FrameStatus {
    First = 0,
    Continue = 1,
    Last = 2,
}

impl FrameStatus {
    pub fn code(&self) -> u8 {
        *self as u8
    }

    fn command(&self) -> &'static str {
        match self {
            FrameStatus::First => "ssb",
            FrameStatus::Continue | FrameStatus::Last => "auw",
        }
    }

    fn audio_status(&self) -> u8 {
        match self {
            FrameStatus::First => 1,
            FrameStatus::Continue => 2,
            FrameStatus::Last => 4,
        }
    }
}

impl Serialize for FrameStatus {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_u8(self.code())
    }
}

/// Immutable parameters of one evaluation
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SessionParams {
    pub text: String,
    pub category: String,
    pub ent: String,
    pub encoding: AudioEncoding,
    pub app_id: String,
    pub group: String,
}

impl SessionParams {
    /// Fails with `IseError::Config` if the reference text or app id is empty.
    pub fn new(
        text: impl Into<String>,
        category: impl Into<String>,
        app_id: impl Into<String>,
    ) -> Result<Self, IseError> {
        let defaults = IseConfig::default();
        let params = Self {
            text: text.into(),
            category: category.into(),
            ent: defaults.ent,
            encoding: defaults.encoding,
            app_id: app_id.into(),
            group: defaults.group,
        };
        params.validate()?;
        Ok(params)
    }

    pub fn from_config(config: &IseConfig, text: impl Into<String>) -> Result<Self, IseError> {
        let params = Self {
            text: text.into(),
            category: config.category.clone(),
            ent: config.ent.clone(),
            encoding: config.encoding,
            app_id: config.app_id.clone(),
            group: config.group.clone(),
        };
        params.validate()?;
        Ok(params)
    }

    pub fn with_encoding(mut self, encoding: AudioEncoding) -> Self {
        self.encoding = encoding;
        self
    }

    pub fn with_ent(mut self, ent: impl Into<String>) -> Self {
        self.ent = ent.into();
        self
    }

    fn validate(&self) -> Result<(), IseError> {
        if self.text.is_empty() {
            return Err(IseError::Config("reference text must not be empty".to_string()));
        }
        if self.app_id.is_empty() {
            return Err(IseError::Config("appId must not be empty".to_string()));
        }
        if self.category.is_empty() {
            return Err(IseError::Config("category must not be empty".to_string()));
        }
        Ok(())
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct Common {
    pub app_id: String,
}

/// `business` section; the optional fields are only present on the first frame
#[derive(Debug, Clone, Serialize)]
pub struct Business {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub category: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub rstcd: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub group: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub sub: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub tte: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub auf: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub ent: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub text: Option<String>,
    pub cmd: String,
    pub aus: u8,
    pub aue: String,
}

impl Business {
    fn control(status: FrameStatus, encoding: AudioEncoding) -> Self {
        Self {
            category: None,
            rstcd: None,
            group: None,
            sub: None,
            tte: None,
            auf: None,
            ent: None,
            text: None,
            cmd: status.command().to_string(),
            aus: status.audio_status(),
            aue: encoding.as_str().to_string(),
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct FrameData {
    pub status: FrameStatus,
    pub encoding: String,
    pub data_type: u8,
    /// Base64 audio; empty for the last frame
    pub data: String,
}

/// One outgoing protocol message
#[derive(Debug, Clone, Serialize)]
pub struct ProtocolFrame {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub common: Option<Common>,
    pub business: Business,
    pub data: FrameData,
}

impl ProtocolFrame {
    /// First frame: full control envelope, reference text and the first chunk (may be empty)
    pub fn first(params: &SessionParams, audio: &[u8]) -> Self {
        let mut business = Business::control(FrameStatus::First, params.encoding);
        business.category = Some(params.category.clone());
        business.rstcd = Some("utf8".to_string());
        business.group = Some(params.group.clone());
        business.sub = Some("ise".to_string());
        business.tte = Some("utf-8".to_string());
        business.auf = Some(AUDIO_FORMAT.to_string());
        business.ent = Some(params.ent.clone());
        business.text = Some(format!("{}{}", TEXT_BOM, params.text));

        Self {
            common: Some(Common {
                app_id: params.app_id.clone(),
            }),
            business,
            data: FrameData::audio(FrameStatus::First, params.encoding, audio),
        }
    }

    pub fn middle(encoding: AudioEncoding, audio: &[u8]) -> Self {
        Self {
            common: None,
            business: Business::control(FrameStatus::Continue, encoding),
            data: FrameData::audio(FrameStatus::Continue, encoding, audio),
        }
    }

    pub fn last(encoding: AudioEncoding) -> Self {
        Self {
            common: None,
            business: Business::control(FrameStatus::Last, encoding),
            data: FrameData::audio(FrameStatus::Last, encoding, &[]),
        }
    }

    pub fn status(&self) -> FrameStatus {
        self.data.status
    }

    pub fn to_json(&self) -> Result<String, IseError> {
        serde_json::to_string(self).map_err(|e| IseError::Protocol(e.to_string()))
    }
}

impl FrameData {
    fn audio(status: FrameStatus, encoding: AudioEncoding, audio: &[u8]) -> Self {
        Self {
            status,
            encoding: encoding.as_str().to_string(),
            data_type: 1,
            data: if audio.is_empty() {
                String::new()
            } else {
                STANDARD.encode(audio)
            },
        }
    }
}
