#![allow(dead_code)]

use std::collections::{BTreeMap, HashMap, VecDeque};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use axum::Router;
use axum::extract::{Path as UrlPath, State};
use axum::http::{HeaderMap, StatusCode, header};
use axum::response::{IntoResponse, Response};
use axum::routing::get;

use streamdl::common::config::{EngineConfig, RetryPolicy};
use streamdl::downloader::error::DownloadError;
use streamdl::manifest::{
    ManifestError, ManifestSource, MediaKind, MediaSegment, ParsedManifest, Protocol,
    Representation, RepresentationContent, Timeline,
};
use streamdl::post_process::merger::{MergeSession, Remuxer};
use streamdl::{DownloadEngine, Progress, ProgressSink, Task, TaskState};

pub const VIDEO_FORMAT: &str = "hls-720p-1000";

// ---------------------------------------------------------------------------
// HTTP 夹具
// ---------------------------------------------------------------------------

// 先放过 `skip` 次请求，再失败 `remaining` 次，u32::MAX 表示一直失败
#[derive(Debug, Clone, Copy)]
struct FailPlan {
    skip: u32,
    remaining: u32,
}

#[derive(Default)]
struct FixtureState {
    blobs: Mutex<HashMap<String, Vec<u8>>>,
    failures: Mutex<HashMap<String, FailPlan>>,
    hits: Mutex<HashMap<String, u64>>,
    ranges: Mutex<Vec<String>>,
    delay_ms: AtomicU64,
    in_flight: AtomicUsize,
    max_in_flight: AtomicUsize,
    no_ranges: AtomicBool,
}

struct Flight<'a>(&'a AtomicUsize);

impl Drop for Flight<'_> {
    fn drop(&mut self) {
        self.0.fetch_sub(1, Ordering::SeqCst);
    }
}

impl FixtureState {
    fn enter(&self) -> Flight<'_> {
        let now = self.in_flight.fetch_add(1, Ordering::SeqCst) + 1;
        self.max_in_flight.fetch_max(now, Ordering::SeqCst);
        Flight(&self.in_flight)
    }

    fn take_failure(&self, path: &str) -> bool {
        let mut failures = self.failures.lock().unwrap();
        let Some(plan) = failures.get_mut(path) else {
            return false;
        };
        if plan.skip > 0 {
            plan.skip -= 1;
            return false;
        }
        match plan.remaining {
            0 => false,
            u32::MAX => true,
            _ => {
                plan.remaining -= 1;
                true
            }
        }
    }
}

fn parse_range(value: &str, len: usize) -> Option<(usize, usize)> {
    let bounds = value.strip_prefix("bytes=")?;
    let (start, end) = bounds.split_once('-')?;
    let start: usize = start.parse().ok()?;
    let end = if end.is_empty() {
        len.checked_sub(1)?
    } else {
        end.parse::<usize>().ok()?.min(len.checked_sub(1)?)
    };
    (start <= end).then_some((start, end))
}

async fn serve(
    State(state): State<Arc<FixtureState>>,
    UrlPath(path): UrlPath<String>,
    headers: HeaderMap,
) -> Response {
    *state.hits.lock().unwrap().entry(path.clone()).or_insert(0) += 1;
    let _flight = state.enter();

    let delay = state.delay_ms.load(Ordering::SeqCst);
    if delay > 0 {
        tokio::time::sleep(Duration::from_millis(delay)).await;
    }
    if state.take_failure(&path) {
        return StatusCode::INTERNAL_SERVER_ERROR.into_response();
    }
    let Some(body) = state.blobs.lock().unwrap().get(&path).cloned() else {
        return StatusCode::NOT_FOUND.into_response();
    };

    let range = headers
        .get(header::RANGE)
        .and_then(|v| v.to_str().ok())
        .map(str::to_string);
    if let Some(range) = range
        && !state.no_ranges.load(Ordering::SeqCst)
    {
        state.ranges.lock().unwrap().push(range.clone());
        if let Some((start, end)) = parse_range(&range, body.len()) {
            let content_range = format!("bytes {}-{}/{}", start, end, body.len());
            return (
                StatusCode::PARTIAL_CONTENT,
                [(header::CONTENT_RANGE, content_range)],
                body[start..=end].to_vec(),
            )
                .into_response();
        }
        return StatusCode::RANGE_NOT_SATISFIABLE.into_response();
    }
    (StatusCode::OK, body).into_response()
}

/// 本地 HTTP 服务：分片、失败、慢速、区间请求
pub struct Fixture {
    state: Arc<FixtureState>,
    base: String,
}

impl Fixture {
    pub async fn start() -> Self {
        let state = Arc::new(FixtureState::default());
        let app = Router::new()
            .route("/{*path}", get(serve))
            .with_state(Arc::clone(&state));

        let listener =
            std::net::TcpListener::bind("127.0.0.1:0").expect("failed to bind fixture server");
        listener
            .set_nonblocking(true)
            .expect("failed to set nonblocking on fixture listener");
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            let listener = tokio::net::TcpListener::from_std(listener)
                .expect("failed to convert fixture listener");
            axum::serve(listener, app).await.unwrap();
        });

        Self {
            state,
            base: format!("http://{}/", addr),
        }
    }

    pub fn url(&self, path: &str) -> String {
        format!("{}{}", self.base, path)
    }

    pub fn put(&self, path: &str, body: Vec<u8>) {
        self.state
            .blobs
            .lock()
            .unwrap()
            .insert(path.to_string(), body);
    }

    /// 接下来 `times` 次请求返回 500
    pub fn fail(&self, path: &str, times: u32) {
        self.fail_after(path, 0, times);
    }

    /// 前 `skip` 次请求正常，之后 `times` 次返回 500
    pub fn fail_after(&self, path: &str, skip: u32, times: u32) {
        self.state.failures.lock().unwrap().insert(
            path.to_string(),
            FailPlan {
                skip,
                remaining: times,
            },
        );
    }

    pub fn fail_always(&self, path: &str) {
        self.fail(path, u32::MAX);
    }

    pub fn clear_failures(&self) {
        self.state.failures.lock().unwrap().clear();
    }

    pub fn hits(&self, path: &str) -> u64 {
        *self.state.hits.lock().unwrap().get(path).unwrap_or(&0)
    }

    pub fn set_delay(&self, delay: Duration) {
        self.state
            .delay_ms
            .store(delay.as_millis() as u64, Ordering::SeqCst);
    }

    pub fn max_in_flight(&self) -> usize {
        self.state.max_in_flight.load(Ordering::SeqCst)
    }

    pub fn disable_ranges(&self) {
        self.state.no_ranges.store(true, Ordering::SeqCst);
    }

    pub fn ranges(&self) -> Vec<String> {
        self.state.ranges.lock().unwrap().clone()
    }
}

/// 每个分片内容不同，便于检查合并顺序
pub fn payload(tag: u8, len: usize) -> Vec<u8> {
    (0..len).map(|i| tag.wrapping_add((i % 251) as u8)).collect()
}

// ---------------------------------------------------------------------------
// 假的合并工具：把输入按顺序拼接到输出
// ---------------------------------------------------------------------------

#[derive(Default)]
pub struct FakeRemuxer {
    calls: Mutex<Vec<Vec<String>>>,
    fail: AtomicBool,
}

impl FakeRemuxer {
    pub fn failing() -> Self {
        let remuxer = Self::default();
        remuxer.fail.store(true, Ordering::SeqCst);
        remuxer
    }

    pub fn calls(&self) -> Vec<Vec<String>> {
        self.calls.lock().unwrap().clone()
    }

    fn expand_input(input: &Path) -> Vec<PathBuf> {
        let text = || std::fs::read_to_string(input).unwrap();
        match input.extension().and_then(|e| e.to_str()) {
            Some("txt") => text()
                .lines()
                .filter_map(|line| line.strip_prefix("file '")?.strip_suffix('\'').map(str::to_string))
                .map(|p| PathBuf::from(p.replace("'\\''", "'")))
                .collect(),
            Some("m3u8") => {
                let dir = input.parent().unwrap().to_path_buf();
                text()
                    .lines()
                    .filter(|line| !line.starts_with('#') && !line.trim().is_empty())
                    .map(|line| dir.join(line.trim()))
                    .collect()
            }
            _ => vec![input.to_path_buf()],
        }
    }
}

#[async_trait]
impl Remuxer for FakeRemuxer {
    async fn remux(&self, args: &[String]) -> Result<MergeSession, DownloadError> {
        self.calls.lock().unwrap().push(args.to_vec());
        if self.fail.load(Ordering::SeqCst) {
            return Ok(MergeSession {
                success: false,
                return_code: Some(1),
                logs: "Invalid data found when processing input".into(),
            });
        }

        let inputs: Vec<PathBuf> = args
            .windows(2)
            .filter(|pair| pair[0] == "-i")
            .map(|pair| PathBuf::from(&pair[1]))
            .collect();
        let output = PathBuf::from(args.last().unwrap());

        let mut merged = Vec::new();
        for input in inputs {
            for part in Self::expand_input(&input) {
                merged.extend(tokio::fs::read(&part).await?);
            }
        }
        tokio::fs::write(&output, merged).await?;
        Ok(MergeSession {
            success: true,
            return_code: Some(0),
            logs: String::new(),
        })
    }
}

// ---------------------------------------------------------------------------
// 清单
// ---------------------------------------------------------------------------

/// 按顺序返回预设的清单，用完后重复最后一个
#[derive(Default)]
pub struct ScriptedSource {
    queue: Mutex<VecDeque<ParsedManifest>>,
    last: Mutex<Option<ParsedManifest>>,
    calls: AtomicUsize,
}

impl ScriptedSource {
    pub fn new(manifests: Vec<ParsedManifest>) -> Self {
        Self {
            queue: Mutex::new(manifests.into()),
            ..Default::default()
        }
    }

    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl ManifestSource for ScriptedSource {
    async fn fetch(
        &self,
        _url: &str,
        _headers: &BTreeMap<String, String>,
    ) -> Result<ParsedManifest, ManifestError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        let next = self.queue.lock().unwrap().pop_front();
        let mut last = self.last.lock().unwrap();
        if let Some(next) = next {
            *last = Some(next);
        }
        last.clone()
            .ok_or_else(|| ManifestError::Fetch("没有可用的清单".into()))
    }
}

pub fn segments(urls: &[String], duration: f64) -> Vec<MediaSegment> {
    urls.iter()
        .map(|url| MediaSegment::new(url.clone(), duration))
        .collect()
}

pub fn representation(
    kind: MediaKind,
    height: Option<u32>,
    bandwidth: u64,
    content: RepresentationContent,
    timeline: Timeline,
) -> Representation {
    Representation {
        id: String::new(),
        kind,
        width: height.map(|h| h * 16 / 9),
        height,
        bandwidth,
        codecs: None,
        group_id: None,
        name: None,
        content,
        timeline,
    }
}

/// 720p / 1000 码率的视频，格式 id 为 `hls-720p-1000`
pub fn video_manifest(
    protocol: Protocol,
    video: Vec<MediaSegment>,
    audio: Option<Vec<MediaSegment>>,
    timeline: Timeline,
) -> ParsedManifest {
    ParsedManifest {
        protocol,
        video: vec![representation(
            MediaKind::Video,
            Some(720),
            1000,
            RepresentationContent::Segments(video),
            timeline.clone(),
        )],
        audio: audio
            .map(|segments| {
                vec![representation(
                    MediaKind::Audio,
                    None,
                    128,
                    RepresentationContent::Segments(segments),
                    timeline,
                )]
            })
            .unwrap_or_default(),
    }
}

pub fn live_timeline(target_duration: f64, ended: bool) -> Timeline {
    Timeline {
        target_duration: Some(target_duration),
        minimum_update_period: None,
        ended,
    }
}

pub fn ended() -> Timeline {
    Timeline {
        ended: true,
        ..Default::default()
    }
}

// ---------------------------------------------------------------------------
// 引擎与进度
// ---------------------------------------------------------------------------

pub fn test_config(temp_dir: &Path) -> EngineConfig {
    EngineConfig {
        threads: 3,
        retry: RetryPolicy {
            attempts: 3,
            base_delay_ms: 20,
        },
        poll_interval_ms: 20,
        temp_dir: temp_dir.to_path_buf(),
        ..Default::default()
    }
}

pub fn engine(
    config: EngineConfig,
    remuxer: Arc<FakeRemuxer>,
    source: Arc<ScriptedSource>,
) -> DownloadEngine {
    DownloadEngine::new(config, remuxer, source).unwrap()
}

/// 记录所有上报
#[derive(Default)]
pub struct RecordingSink {
    reports: Mutex<Vec<(Progress, TaskState)>>,
}

impl RecordingSink {
    pub fn reports(&self) -> Vec<(Progress, TaskState)> {
        self.reports.lock().unwrap().clone()
    }

    pub fn downloading(&self) -> Vec<Progress> {
        self.reports()
            .into_iter()
            .filter(|(_, state)| *state == TaskState::Downloading)
            .map(|(progress, _)| progress)
            .collect()
    }

    pub fn states(&self) -> Vec<TaskState> {
        self.reports().into_iter().map(|(_, state)| state).collect()
    }

    /// 等到至少下载了 `bytes` 字节
    pub async fn wait_for_bytes(&self, bytes: u64) {
        for _ in 0..500 {
            if self
                .downloading()
                .iter()
                .any(|p| p.current_bytes >= bytes)
            {
                return;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        panic!("没有等到 {} 字节的进度", bytes);
    }
}

impl ProgressSink for RecordingSink {
    fn report(&self, _task: &Task, progress: Progress, state: TaskState) {
        self.reports.lock().unwrap().push((progress, state));
    }
}

pub fn work_dir(temp_dir: &Path, task: &Task) -> PathBuf {
    temp_dir.join(&task.id)
}
