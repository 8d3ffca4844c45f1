use serde::{Deserialize, Serialize};
use std::fmt;

// 清单协议
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum Protocol {
    #[default]
    Hls,
    Dash,
}

impl fmt::Display for Protocol {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Protocol::Hls => write!(f, "HLS"),
            Protocol::Dash => write!(f, "DASH"),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MediaKind {
    Video,
    Audio,
}

impl fmt::Display for MediaKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            MediaKind::Video => write!(f, "video"),
            MediaKind::Audio => write!(f, "audio"),
        }
    }
}

/// 初始化分片（fMP4 的 moov 等），存在即表示该流是分片 MP4 容器
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct InitSegment {
    pub url: String,
}

/// 加密描述。`key` 为调用方已解析好的对称密钥，缺省时按 `uri` 拉取
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EncryptionKey {
    pub method: String,
    pub uri: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub key: Option<Vec<u8>>,
}

/// 一个媒体分片，由外部清单解析器产出，引擎只读
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MediaSegment {
    pub url: String,
    // 秒
    #[serde(default)]
    pub duration: f64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub init: Option<InitSegment>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub encryption: Option<EncryptionKey>,
}

impl MediaSegment {
    pub fn new(url: impl Into<String>, duration: f64) -> Self {
        Self {
            url: url.into(),
            duration,
            init: None,
            encryption: None,
        }
    }

    /// 带初始化分片即为分片 MP4，否则按 TS 处理
    pub fn is_fragmented(&self) -> bool {
        self.init.is_some()
    }
}

// 一个质量档位的内容：分片列表或整文件地址
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RepresentationContent {
    Segments(Vec<MediaSegment>),
    BaseUrls(Vec<String>),
}

impl Default for RepresentationContent {
    fn default() -> Self {
        RepresentationContent::Segments(Vec::new())
    }
}

/// 直播时间线信息
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Timeline {
    // HLS #EXT-X-TARGETDURATION，秒
    #[serde(default)]
    pub target_duration: Option<f64>,
    // DASH minimumUpdatePeriod，秒
    #[serde(default)]
    pub minimum_update_period: Option<f64>,
    // HLS 出现 #EXT-X-ENDLIST，或 DASH type=static
    #[serde(default)]
    pub ended: bool,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Representation {
    #[serde(default)]
    pub id: String,
    pub kind: MediaKind,
    #[serde(default)]
    pub width: Option<u32>,
    #[serde(default)]
    pub height: Option<u32>,
    #[serde(default)]
    pub bandwidth: u64,
    #[serde(default)]
    pub codecs: Option<String>,
    // HLS 音频 rendition 的 GROUP-ID / NAME
    #[serde(default)]
    pub group_id: Option<String>,
    #[serde(default)]
    pub name: Option<String>,
    #[serde(default)]
    pub content: RepresentationContent,
    #[serde(default)]
    pub timeline: Timeline,
}

impl Representation {
    pub fn segments(&self) -> &[MediaSegment] {
        match &self.content {
            RepresentationContent::Segments(segments) => segments,
            RepresentationContent::BaseUrls(_) => &[],
        }
    }

    pub fn base_urls(&self) -> &[String] {
        match &self.content {
            RepresentationContent::BaseUrls(urls) => urls,
            RepresentationContent::Segments(_) => &[],
        }
    }

    pub fn has_media(&self) -> bool {
        !self.segments().is_empty() || !self.base_urls().is_empty()
    }
}

/// 外部解析器给出的完整清单
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ParsedManifest {
    #[serde(default)]
    pub protocol: Protocol,
    #[serde(default)]
    pub video: Vec<Representation>,
    #[serde(default)]
    pub audio: Vec<Representation>,
}

// 清单形态：分片列表还是整文件
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ManifestShape {
    SegmentList,
    BaseUrl,
}

/// 按格式 id 选中的音视频轨
#[derive(Debug, Clone, PartialEq)]
pub struct TrackSelection {
    pub protocol: Protocol,
    pub video: Option<Representation>,
    pub audio: Option<Representation>,
}

impl TrackSelection {
    /// 以视频为主，没有视频时看音频
    pub fn shape(&self) -> Option<ManifestShape> {
        let primary = self.video.as_ref().or(self.audio.as_ref())?;
        if !primary.segments().is_empty() {
            Some(ManifestShape::SegmentList)
        } else if !primary.base_urls().is_empty() {
            Some(ManifestShape::BaseUrl)
        } else {
            None
        }
    }

    pub fn video_segments(&self) -> &[MediaSegment] {
        self.video.as_ref().map(|r| r.segments()).unwrap_or(&[])
    }

    pub fn audio_segments(&self) -> &[MediaSegment] {
        self.audio.as_ref().map(|r| r.segments()).unwrap_or(&[])
    }

    /// 两路都结束才算结束；缺失的一路视为已结束
    pub fn is_ended(&self) -> bool {
        let video_ended = self.video.as_ref().is_none_or(|r| r.timeline.ended);
        let audio_ended = self.audio.as_ref().is_none_or(|r| r.timeline.ended);
        video_ended && audio_ended
    }

    pub fn timeline(&self) -> Option<&Timeline> {
        self.video
            .as_ref()
            .or(self.audio.as_ref())
            .map(|r| &r.timeline)
    }
}
