use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use tokio::io::AsyncWriteExt;
use tracing::{debug, info, warn};

use super::error::DownloadError;
use super::layout::{WorkDir, non_empty};
use crate::common::client::HttpClient;
use crate::manifest::{MediaKind, MediaSegment};
use crate::post_process::merger::{MergeSession, Remuxer};

/// 源视频编码，决定合并时是否需要转码
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CodecHint(pub Option<String>);

impl CodecHint {
    pub fn new(codec: Option<&str>) -> Self {
        Self(codec.map(str::to_string))
    }

    /// HEVC / Dolby Vision 转成 H.264 以便播放
    pub fn needs_transcode(&self) -> bool {
        self.0
            .as_deref()
            .is_some_and(|c| c.starts_with("hvc1") || c.starts_with("dvh1"))
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InputKind {
    // ffmpeg concat demuxer 列表
    ConcatList,
    // 带 #EXT-X-KEY 的本地 m3u8
    EncryptedPlaylist,
    File,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MergeInput {
    pub kind: InputKind,
    pub path: PathBuf,
    // TS 输入需要 aac_adtstoasc
    pub transport_stream: bool,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MergePlan {
    pub video: Option<MergeInput>,
    pub audio: Option<MergeInput>,
    pub transcode: bool,
    pub output: PathBuf,
}

fn push_input(args: &mut Vec<String>, input: &MergeInput) {
    match input.kind {
        InputKind::ConcatList => {
            args.extend(["-f", "concat", "-safe", "0"].map(String::from));
        }
        InputKind::EncryptedPlaylist => {
            args.extend(
                [
                    "-protocol_whitelist",
                    "file,pipe,crypto",
                    "-allowed_extensions",
                    "ALL",
                ]
                .map(String::from),
            );
        }
        InputKind::File => {}
    }
    args.push("-i".to_string());
    args.push(input.path.to_string_lossy().to_string());
}

/// 生成 ffmpeg 参数
pub fn build_merge_args(plan: &MergePlan) -> Vec<String> {
    let mut args = vec!["-y".to_string()];
    if let Some(video) = &plan.video {
        push_input(&mut args, video);
    }
    if let Some(audio) = &plan.audio {
        push_input(&mut args, audio);
    }

    let has_video = plan.video.is_some();
    let has_audio = plan.audio.is_some();
    let map: &[&str] = match (has_video, has_audio) {
        (true, true) => &["-map", "0:v?", "-map", "1:a?"],
        (true, false) => &["-map", "0"],
        (false, true) => &["-map", "0:a?"],
        (false, false) => &[],
    };
    args.extend(map.iter().map(|s| s.to_string()));

    if plan.transcode && has_video {
        args.extend(
            [
                "-c:v", "libx264", "-preset", "veryfast", "-crf", "23", "-pix_fmt", "yuv420p",
            ]
            .map(String::from),
        );
        if has_audio {
            args.extend(["-c:a", "copy"].map(String::from));
        }
    } else {
        args.extend(["-c", "copy"].map(String::from));
    }

    let has_ts = plan
        .video
        .iter()
        .chain(plan.audio.iter())
        .any(|i| i.transport_stream);
    if has_ts {
        args.extend(["-bsf:a", "aac_adtstoasc"].map(String::from));
    }
    args.extend(["-movflags", "+faststart"].map(String::from));
    args.push(plan.output.to_string_lossy().to_string());
    args
}

// concat 列表里的单引号需要转义
fn concat_line(path: &Path) -> String {
    let escaped = path.to_string_lossy().replace('\'', "'\\''");
    format!("file '{}'\n", escaped)
}

/// 准备合并输入并调用外部工具
pub struct MergeInvoker {
    remuxer: Arc<dyn Remuxer>,
    client: HttpClient,
    headers: BTreeMap<String, String>,
    work_dir: WorkDir,
}

impl MergeInvoker {
    pub fn new(
        remuxer: Arc<dyn Remuxer>,
        client: HttpClient,
        headers: BTreeMap<String, String>,
        work_dir: WorkDir,
    ) -> Self {
        Self {
            remuxer,
            client,
            headers,
            work_dir,
        }
    }

    /// 合并分片列表，分片文件按下标存放在工作目录中
    pub async fn merge_segments(
        &self,
        video: &[MediaSegment],
        audio: &[MediaSegment],
        output: &Path,
        codec: &CodecHint,
    ) -> Result<MergeSession, DownloadError> {
        if video.is_empty() && audio.is_empty() {
            return Err(DownloadError::InvalidState("没有可合并的分片".into()));
        }
        info!(
            "开始合并 {} 个视频分片和 {} 个音频分片",
            video.len(),
            audio.len()
        );

        let mut intermediates = Vec::new();
        let video_input = if video.is_empty() {
            None
        } else {
            Some(self.prepare_input(MediaKind::Video, video, &mut intermediates).await?)
        };
        let audio_input = if audio.is_empty() {
            None
        } else {
            Some(self.prepare_input(MediaKind::Audio, audio, &mut intermediates).await?)
        };

        let plan = MergePlan {
            video: video_input,
            audio: audio_input,
            transcode: codec.needs_transcode(),
            output: output.to_path_buf(),
        };
        let result = self.remuxer.remux(&build_merge_args(&plan)).await;

        for path in intermediates {
            if let Err(e) = tokio::fs::remove_file(&path).await {
                debug!("删除中间文件失败 {:?}: {}", path, e);
            }
        }
        result
    }

    /// 合并整文件（BaseURL 下载的结果）
    pub async fn merge_files(
        &self,
        video: Option<&Path>,
        audio: Option<&Path>,
        output: &Path,
        codec: &CodecHint,
    ) -> Result<MergeSession, DownloadError> {
        let as_input = |path: &Path| MergeInput {
            kind: InputKind::File,
            path: path.to_path_buf(),
            transport_stream: false,
        };
        let plan = MergePlan {
            video: video.map(as_input),
            audio: audio.map(as_input),
            transcode: codec.needs_transcode(),
            output: output.to_path_buf(),
        };
        if plan.video.is_none() && plan.audio.is_none() {
            return Err(DownloadError::InvalidState("没有可合并的文件".into()));
        }
        self.remuxer.remux(&build_merge_args(&plan)).await
    }

    async fn prepare_input(
        &self,
        kind: MediaKind,
        segments: &[MediaSegment],
        intermediates: &mut Vec<PathBuf>,
    ) -> Result<MergeInput, DownloadError> {
        let first = &segments[0];
        if let Some(init) = &first.init {
            let path = self.concatenate_fragments(kind, &init.url, segments.len()).await?;
            intermediates.push(path.clone());
            return Ok(MergeInput {
                kind: InputKind::File,
                path,
                transport_stream: false,
            });
        }

        if first.encryption.is_some() {
            let path = self.write_encrypted_playlist(kind, segments).await?;
            return Ok(MergeInput {
                kind: InputKind::EncryptedPlaylist,
                path,
                transport_stream: true,
            });
        }

        let path = self.write_concat_list(kind, segments.len()).await?;
        Ok(MergeInput {
            kind: InputKind::ConcatList,
            path,
            transport_stream: true,
        })
    }

    /// 分片 MP4：初始化分片 + 所有媒体分片拼成一个文件
    async fn concatenate_fragments(
        &self,
        kind: MediaKind,
        init_url: &str,
        count: usize,
    ) -> Result<PathBuf, DownloadError> {
        let init_path = self.work_dir.init_path(kind);
        if !non_empty(&init_path).await? {
            if init_url.is_empty() {
                warn!("{} 初始化分片不存在且没有地址，直接拼接媒体分片", kind);
            } else {
                self.download_to(init_url, &init_path).await?;
            }
        }

        let target = self.work_dir.concatenated_path(kind);
        let mut output = tokio::fs::File::create(&target).await?;
        if non_empty(&init_path).await? {
            let mut init = tokio::fs::File::open(&init_path).await?;
            tokio::io::copy(&mut init, &mut output).await?;
        }
        for index in 0..count {
            let path = self.work_dir.segment_path(kind, index, true);
            match tokio::fs::File::open(&path).await {
                Ok(mut segment) => {
                    tokio::io::copy(&mut segment, &mut output).await?;
                }
                Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                    warn!("找不到 {} 分片文件: {:?}", kind, path);
                }
                Err(e) => return Err(e.into()),
            }
        }
        output.flush().await?;
        debug!("{} 分片已拼接到 {:?}", kind, target);
        Ok(target)
    }

    async fn write_concat_list(&self, kind: MediaKind, count: usize) -> Result<PathBuf, DownloadError> {
        let mut content = String::new();
        for index in 0..count {
            let path = self.work_dir.segment_path(kind, index, false);
            // 列表里的相对路径按列表所在目录解析，统一写绝对路径
            let absolute = std::path::absolute(&path)?;
            content.push_str(&concat_line(&absolute));
        }
        let list = self.work_dir.concat_list_path(kind);
        tokio::fs::write(&list, content).await?;
        debug!("生成 concat 列表: {:?}", list);
        Ok(list)
    }

    async fn write_encrypted_playlist(
        &self,
        kind: MediaKind,
        segments: &[MediaSegment],
    ) -> Result<PathBuf, DownloadError> {
        let Some(key) = segments[0].encryption.as_ref() else {
            return Err(DownloadError::InvalidState("分片没有加密信息".into()));
        };
        let key_path = self.work_dir.key_path(kind);
        match &key.key {
            Some(bytes) => tokio::fs::write(&key_path, bytes).await?,
            None => self.download_to(&key.uri, &key_path).await?,
        }
        debug!("{} 加密方式 {}，密钥写入 {:?}", kind, key.method, key_path);

        let mut content = String::from("#EXTM3U\n#EXT-X-VERSION:3\n");
        let target = segments
            .iter()
            .map(|s| s.duration)
            .fold(0.0_f64, f64::max)
            .ceil()
            .max(1.0);
        content.push_str(&format!("#EXT-X-TARGETDURATION:{}\n", target as u64));
        content.push_str(&format!(
            "#EXT-X-KEY:METHOD={},URI=\"{}\"\n",
            key.method,
            WorkDir::key_file_name(kind)
        ));
        for (index, segment) in segments.iter().enumerate() {
            content.push_str(&format!("#EXTINF:{},\n", segment.duration));
            content.push_str(&WorkDir::segment_name(kind, index, false));
            content.push('\n');
        }
        content.push_str("#EXT-X-ENDLIST\n");

        let playlist = self.work_dir.playlist_path(kind);
        tokio::fs::write(&playlist, content).await?;
        Ok(playlist)
    }

    // 合并阶段的小文件下载不受控制标记影响，停止保存后也要能完成
    async fn download_to(&self, url: &str, path: &Path) -> Result<(), DownloadError> {
        debug!("下载 {} -> {:?}", url, path);
        let resp = self.client.get(url, &self.headers).await?;
        HttpClient::check_response_status(&resp, url)?;
        let bytes = resp.bytes().await?;
        tokio::fs::write(path, &bytes).await?;
        Ok(())
    }
}
