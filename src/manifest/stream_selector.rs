use tracing::debug;

use super::errors::ManifestError;
use super::models::{ParsedManifest, Representation, TrackSelection};

pub struct StreamSelector;

impl StreamSelector {
    /// 根据格式 id 选出要下载的音视频轨
    ///
    /// 命中视频档位时搭配码率最高的音频；命中音频时只下载音频；都不命中返回
    /// [`ManifestError::FormatNotFound`]。
    pub fn select(
        manifest: &ParsedManifest,
        format_id: &str,
    ) -> Result<TrackSelection, ManifestError> {
        if format_id.trim().is_empty() {
            return Err(ManifestError::MissingFormatId);
        }
        debug!("选择格式: {} ({})", format_id, manifest.protocol);

        let video = manifest
            .video
            .iter()
            .find(|rep| Self::video_format_ids(rep).iter().any(|id| id == format_id));

        let selection = if let Some(video) = video {
            let audio = manifest.audio.iter().max_by_key(|rep| rep.bandwidth);
            debug!(
                "命中视频格式 {}x{}，搭配音频: {:?}",
                video.width.unwrap_or(0),
                video.height.unwrap_or(0),
                audio.map(|a| a.bandwidth)
            );
            TrackSelection {
                protocol: manifest.protocol,
                video: Some(video.clone()),
                audio: audio.cloned(),
            }
        } else if let Some(audio) = manifest
            .audio
            .iter()
            .find(|rep| Self::audio_format_ids(rep).iter().any(|id| id == format_id))
        {
            debug!("命中音频格式，仅下载音频: {}", audio.bandwidth);
            TrackSelection {
                protocol: manifest.protocol,
                video: None,
                audio: Some(audio.clone()),
            }
        } else if manifest.video.len() == 1
            && manifest.audio.is_empty()
            && manifest.video[0].id == format_id
        {
            // 单一媒体播放列表没有档位信息，按 id 直接匹配
            TrackSelection {
                protocol: manifest.protocol,
                video: Some(manifest.video[0].clone()),
                audio: None,
            }
        } else {
            return Err(ManifestError::FormatNotFound(format_id.to_string()));
        };

        let has_media = selection.video.as_ref().is_some_and(Representation::has_media)
            || selection.audio.as_ref().is_some_and(Representation::has_media);
        if !has_media {
            return Err(ManifestError::NoMedia);
        }

        Ok(selection)
    }

    fn video_format_ids(rep: &Representation) -> Vec<String> {
        let height = rep.height.unwrap_or(0);
        let mut ids = vec![
            format!("hls-{}p-{}", height, rep.bandwidth),
            format!("mpd-{}p-{}", height, rep.bandwidth),
        ];
        if !rep.id.is_empty() {
            ids.push(rep.id.clone());
        }
        ids
    }

    fn audio_format_ids(rep: &Representation) -> Vec<String> {
        let mut ids = vec![
            format!("hls-audio-{}", rep.bandwidth),
            format!("mpd-audio-{}", rep.bandwidth),
        ];
        if let (Some(group), Some(name)) = (&rep.group_id, &rep.name) {
            ids.push(format!("hls-audio-{}-{}", group, name));
        }
        if !rep.id.is_empty() {
            ids.push(rep.id.clone());
        }
        ids
    }
}
