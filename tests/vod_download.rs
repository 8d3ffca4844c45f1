mod common;

use std::sync::Arc;
use std::time::Duration;

use common::*;
use streamdl::downloader::error::DownloadError;
use streamdl::manifest::{EncryptionKey, InitSegment, MediaSegment, Protocol, Timeline};
use streamdl::{Task, TaskState};

const SEGMENT_SIZE: usize = 100_000;

fn segment_paths(count: usize) -> Vec<String> {
    (0..count).map(|i| format!("vod/seg{}.ts", i)).collect()
}

fn serve_segments(fixture: &Fixture, count: usize) -> Vec<u8> {
    let mut expected = Vec::new();
    for (i, path) in segment_paths(count).iter().enumerate() {
        let body = payload(i as u8, SEGMENT_SIZE);
        expected.extend_from_slice(&body);
        fixture.put(path, body);
    }
    expected
}

fn vod_source(fixture: &Fixture, count: usize) -> Arc<ScriptedSource> {
    let urls: Vec<String> = segment_paths(count).iter().map(|p| fixture.url(p)).collect();
    Arc::new(ScriptedSource::new(vec![video_manifest(
        Protocol::Hls,
        segments(&urls, 4.0),
        None,
        Timeline {
            ended: true,
            ..Default::default()
        },
    )]))
}

fn vod_task(id: &str) -> Task {
    Task::new(id, "http://origin/master.json", VIDEO_FORMAT)
}

#[tokio::test]
async fn ten_segments_with_three_workers() {
    let fixture = Fixture::start().await;
    let expected = serve_segments(&fixture, 10);
    fixture.set_delay(Duration::from_millis(30));

    let temp = tempfile::tempdir().unwrap();
    let remuxer = Arc::new(FakeRemuxer::default());
    let engine = engine(
        test_config(temp.path()),
        Arc::clone(&remuxer),
        vod_source(&fixture, 10),
    );
    let sink = Arc::new(RecordingSink::default());
    let mut task = vod_task("vod-basic");

    let state = engine.run(&mut task, sink.clone()).await.unwrap();
    assert_eq!(state, TaskState::Success);
    assert_eq!(task.state, TaskState::Success);

    // 进度单调，且最后正好等于真实总量
    let progress: Vec<_> = sink
        .downloading()
        .into_iter()
        .filter(|p| p.current_bytes > 0)
        .collect();
    assert_eq!(progress.len(), 10);
    assert!(progress.windows(2).all(|w| w[0].current_bytes <= w[1].current_bytes));
    let last = progress.last().unwrap();
    assert_eq!(last.current_bytes, 1_000_000);
    assert_eq!(last.total_bytes, 1_000_000);
    assert_eq!(task.downloaded_bytes, 1_000_000);
    assert!(sink.states().contains(&TaskState::Prepare));

    assert!(fixture.max_in_flight() <= 3, "in flight: {}", fixture.max_in_flight());

    let dir = work_dir(temp.path(), &task);
    for i in 0..10 {
        assert!(dir.join(format!("segment_{:05}.ts", i)).exists());
    }
    let output = task.output_path.clone().unwrap();
    assert_eq!(output, dir.join("merged_output.mp4"));
    assert_eq!(tokio::fs::read(&output).await.unwrap(), expected);

    let calls = remuxer.calls();
    assert_eq!(calls.len(), 1);
    assert!(calls[0].join(" ").contains("-f concat -safe 0 -i"));
}

#[tokio::test]
async fn existing_segments_are_not_downloaded_again() {
    let fixture = Fixture::start().await;
    let expected = serve_segments(&fixture, 6);
    let temp = tempfile::tempdir().unwrap();
    let task_id = "vod-resume";

    // 上一次运行留下的前三个分片
    let dir = temp.path().join(task_id);
    tokio::fs::create_dir_all(&dir).await.unwrap();
    for i in 0..3 {
        tokio::fs::write(
            dir.join(format!("segment_{:05}.ts", i)),
            payload(i as u8, SEGMENT_SIZE),
        )
        .await
        .unwrap();
    }

    let remuxer = Arc::new(FakeRemuxer::default());
    let engine = engine(test_config(temp.path()), remuxer, vod_source(&fixture, 6));
    let sink = Arc::new(RecordingSink::default());
    let mut task = vod_task(task_id);
    assert_eq!(
        engine.run(&mut task, sink.clone()).await.unwrap(),
        TaskState::Success
    );

    let paths = segment_paths(6);
    for path in &paths[..3] {
        assert_eq!(fixture.hits(path), 0, "{} downloaded again", path);
    }
    for path in &paths[3..] {
        assert_eq!(fixture.hits(path), 1);
    }
    // 续传基线先上报
    let first = sink
        .downloading()
        .into_iter()
        .find(|p| p.current_bytes > 0)
        .unwrap();
    assert_eq!(first.current_bytes, 3 * SEGMENT_SIZE as u64);
    let merged = tokio::fs::read(task.output_path.unwrap()).await.unwrap();
    assert_eq!(merged, expected);
}

#[tokio::test]
async fn failed_run_resumes_without_refetching() {
    let fixture = Fixture::start().await;
    let expected = serve_segments(&fixture, 8);
    let paths = segment_paths(8);
    fixture.fail_always(&paths[7]);

    let temp = tempfile::tempdir().unwrap();
    let mut config = test_config(temp.path());
    config.threads = 1;
    let remuxer = Arc::new(FakeRemuxer::default());
    let source = vod_source(&fixture, 8);
    let engine = engine(config, Arc::clone(&remuxer), source);

    let mut first = vod_task("vod-retry-later");
    let state = engine
        .run(&mut first, Arc::new(RecordingSink::default()))
        .await
        .unwrap();
    assert_eq!(state, TaskState::Error);
    assert!(first.error_message.as_ref().unwrap().contains("500"));
    assert!(remuxer.calls().is_empty());

    let dir = work_dir(temp.path(), &first);
    let present: Vec<usize> = (0..8)
        .filter(|i| dir.join(format!("segment_{:05}.ts", i)).exists())
        .collect();
    assert_eq!(present, (0..7).collect::<Vec<_>>());
    assert!(!dir.join("segment_00007.ts.part").exists());

    // ERROR 是终态，同一个 id 重新建任务
    fixture.clear_failures();
    let mut second = vod_task("vod-retry-later");
    let state = engine
        .run(&mut second, Arc::new(RecordingSink::default()))
        .await
        .unwrap();
    assert_eq!(state, TaskState::Success);
    for i in present {
        assert_eq!(fixture.hits(&paths[i]), 1);
    }
    assert_eq!(
        tokio::fs::read(second.output_path.unwrap()).await.unwrap(),
        expected
    );
}

#[tokio::test]
async fn cancel_removes_work_dir_and_skips_merge() {
    let fixture = Fixture::start().await;
    serve_segments(&fixture, 10);
    fixture.set_delay(Duration::from_millis(150));

    let temp = tempfile::tempdir().unwrap();
    let mut config = test_config(temp.path());
    config.threads = 1;
    let remuxer = Arc::new(FakeRemuxer::default());
    let engine = engine(config, Arc::clone(&remuxer), vod_source(&fixture, 10));
    let sink = Arc::new(RecordingSink::default());

    let task = vod_task("vod-cancel");
    let handle = {
        let engine = engine.clone();
        let sink = sink.clone();
        let mut task = task.clone();
        tokio::spawn(async move {
            let state = engine.run(&mut task, sink).await;
            (task, state)
        })
    };

    sink.wait_for_bytes(SEGMENT_SIZE as u64).await;
    engine.cancel(&task).await.unwrap();
    let (task, state) = handle.await.unwrap();

    assert_eq!(state.unwrap(), TaskState::Canceled);
    assert_eq!(task.state, TaskState::Canceled);
    assert!(remuxer.calls().is_empty());
    assert!(!work_dir(temp.path(), &task).exists());
    assert!(task.output_path.is_none());
}

#[tokio::test]
async fn pause_keeps_segments_for_resume() {
    let fixture = Fixture::start().await;
    let expected = serve_segments(&fixture, 8);
    fixture.set_delay(Duration::from_millis(100));

    let temp = tempfile::tempdir().unwrap();
    let mut config = test_config(temp.path());
    config.threads = 2;
    let remuxer = Arc::new(FakeRemuxer::default());
    let engine = engine(config, Arc::clone(&remuxer), vod_source(&fixture, 8));
    let sink = Arc::new(RecordingSink::default());

    let task = vod_task("vod-pause");
    let handle = {
        let engine = engine.clone();
        let sink = sink.clone();
        let mut task = task.clone();
        tokio::spawn(async move {
            let state = engine.run(&mut task, sink).await;
            (task, state)
        })
    };
    sink.wait_for_bytes(SEGMENT_SIZE as u64).await;
    engine.pause(&task).await.unwrap();
    let (mut task, state) = handle.await.unwrap();

    assert_eq!(state.unwrap(), TaskState::Pause);
    assert_eq!(task.error_message.as_deref(), Some("Paused"));
    assert!(remuxer.calls().is_empty());
    let dir = work_dir(temp.path(), &task);
    assert!(!dir.join("merged_output.mp4").exists());
    let kept: Vec<usize> = (0..8)
        .filter(|i| dir.join(format!("segment_{:05}.ts", i)).exists())
        .collect();
    assert!(!kept.is_empty() && kept.len() < 8, "kept: {:?}", kept);

    // 暂停不是终态，同一个任务继续
    fixture.set_delay(Duration::ZERO);
    let state = engine
        .run(&mut task, Arc::new(RecordingSink::default()))
        .await
        .unwrap();
    assert_eq!(state, TaskState::Success);
    let paths = segment_paths(8);
    for i in kept {
        assert_eq!(fixture.hits(&paths[i]), 1);
    }
    assert_eq!(
        tokio::fs::read(task.output_path.unwrap()).await.unwrap(),
        expected
    );
}

#[tokio::test]
async fn stop_and_save_on_vod_keeps_work_as_paused() {
    let fixture = Fixture::start().await;
    serve_segments(&fixture, 6);
    fixture.set_delay(Duration::from_millis(100));

    let temp = tempfile::tempdir().unwrap();
    let mut config = test_config(temp.path());
    config.threads = 1;
    let remuxer = Arc::new(FakeRemuxer::default());
    let engine = engine(config, Arc::clone(&remuxer), vod_source(&fixture, 6));
    let sink = Arc::new(RecordingSink::default());

    let task = vod_task("vod-stop-save");
    let handle = {
        let engine = engine.clone();
        let sink = sink.clone();
        let mut task = task.clone();
        tokio::spawn(async move {
            let state = engine.run(&mut task, sink).await;
            (task, state)
        })
    };
    sink.wait_for_bytes(SEGMENT_SIZE as u64).await;
    assert!(engine.is_active(&task.id));
    engine.request_stop_and_save(&task).await.unwrap();
    let (task, state) = handle.await.unwrap();

    assert_eq!(state.unwrap(), TaskState::Pause);
    assert!(remuxer.calls().is_empty());
    assert!(work_dir(temp.path(), &task).exists());
    assert!(!engine.is_active(&task.id));
}

#[tokio::test]
async fn unknown_format_is_an_error() {
    let fixture = Fixture::start().await;
    serve_segments(&fixture, 2);
    let temp = tempfile::tempdir().unwrap();
    let engine = engine(
        test_config(temp.path()),
        Arc::new(FakeRemuxer::default()),
        vod_source(&fixture, 2),
    );

    let mut task = Task::new("vod-format", "http://origin/master.json", "hls-2160p-9000");
    let state = engine
        .run(&mut task, Arc::new(RecordingSink::default()))
        .await
        .unwrap();
    assert_eq!(state, TaskState::Error);
    assert!(task.error_message.unwrap().contains("hls-2160p-9000"));
    assert_eq!(fixture.hits("vod/seg0.ts"), 0);
}

#[tokio::test]
async fn finished_task_is_not_run_again() {
    let temp = tempfile::tempdir().unwrap();
    let engine = engine(
        test_config(temp.path()),
        Arc::new(FakeRemuxer::default()),
        Arc::new(ScriptedSource::default()),
    );
    let mut task = vod_task("vod-done");
    task.finish(TaskState::Success, None).unwrap();

    let err = engine
        .run(&mut task, Arc::new(RecordingSink::default()))
        .await
        .unwrap_err();
    assert!(matches!(err, DownloadError::InvalidState(_)));
}

#[tokio::test]
async fn merge_failure_fails_the_task() {
    let fixture = Fixture::start().await;
    serve_segments(&fixture, 3);
    let temp = tempfile::tempdir().unwrap();
    let engine = engine(
        test_config(temp.path()),
        Arc::new(FakeRemuxer::failing()),
        vod_source(&fixture, 3),
    );

    let mut task = vod_task("vod-merge-fail");
    let state = engine
        .run(&mut task, Arc::new(RecordingSink::default()))
        .await
        .unwrap();
    assert_eq!(state, TaskState::Error);
    assert!(task.error_message.as_ref().unwrap().contains("合并失败"));
    // 分片还在，修好合并工具后可以直接续传
    assert!(work_dir(temp.path(), &task).join("segment_00002.ts").exists());
}

#[tokio::test]
async fn fragmented_streams_are_joined_behind_their_init_segment() {
    let fixture = Fixture::start().await;
    fixture.put("fmp4/v-init.mp4", b"INIT".to_vec());
    fixture.put("fmp4/v0.m4s", b"AAA".to_vec());
    fixture.put("fmp4/v1.m4s", b"BBB".to_vec());
    fixture.put("fmp4/a-init.mp4", b"init".to_vec());
    fixture.put("fmp4/a0.m4s", b"aaa".to_vec());

    let fragment = |path: &str, init: &str| {
        let mut segment = MediaSegment::new(fixture.url(path), 4.0);
        segment.init = Some(InitSegment {
            url: fixture.url(init),
        });
        segment
    };
    let video = vec![
        fragment("fmp4/v0.m4s", "fmp4/v-init.mp4"),
        fragment("fmp4/v1.m4s", "fmp4/v-init.mp4"),
    ];
    let audio = vec![fragment("fmp4/a0.m4s", "fmp4/a-init.mp4")];
    let source = Arc::new(ScriptedSource::new(vec![video_manifest(
        Protocol::Dash,
        video,
        Some(audio),
        ended(),
    )]));

    let temp = tempfile::tempdir().unwrap();
    let remuxer = Arc::new(FakeRemuxer::default());
    let engine = engine(test_config(temp.path()), Arc::clone(&remuxer), source);
    let mut task = vod_task("vod-fmp4");

    let state = engine
        .run(&mut task, Arc::new(RecordingSink::default()))
        .await
        .unwrap();
    assert_eq!(state, TaskState::Success, "{:?}", task.error_message);

    let dir = work_dir(temp.path(), &task);
    assert!(dir.join("segment_00001.m4s").exists());
    assert!(dir.join("audio_segment_00000.m4s").exists());
    assert_eq!(tokio::fs::read(dir.join("init_video.m4s")).await.unwrap(), b"INIT");
    assert_eq!(tokio::fs::read(dir.join("init_audio.m4s")).await.unwrap(), b"init");
    // 拼接出的中间文件合并后删除
    assert!(!dir.join("concatenated_video.mp4").exists());
    assert!(!dir.join("concatenated_audio.mp4").exists());

    let merged = tokio::fs::read(task.output_path.unwrap()).await.unwrap();
    assert_eq!(merged, b"INITAAABBBinitaaa");

    let args = remuxer.calls()[0].join(" ");
    assert!(args.contains("concatenated_video.mp4"));
    assert!(args.contains("concatenated_audio.mp4"));
    assert!(!args.contains("-f concat"));
    assert!(!args.contains("aac_adtstoasc"));
}

#[tokio::test]
async fn encrypted_segments_are_merged_through_a_local_playlist() {
    let fixture = Fixture::start().await;
    let expected = serve_segments(&fixture, 3);
    fixture.put("keys/video.key", b"0123456789abcdef".to_vec());

    let key = EncryptionKey {
        method: "AES-128".into(),
        uri: fixture.url("keys/video.key"),
        key: None,
    };
    let video = segment_paths(3)
        .iter()
        .map(|path| {
            let mut segment = MediaSegment::new(fixture.url(path), 4.0);
            segment.encryption = Some(key.clone());
            segment
        })
        .collect();
    let source = Arc::new(ScriptedSource::new(vec![video_manifest(
        Protocol::Hls,
        video,
        None,
        ended(),
    )]));

    let temp = tempfile::tempdir().unwrap();
    let remuxer = Arc::new(FakeRemuxer::default());
    let engine = engine(test_config(temp.path()), Arc::clone(&remuxer), source);
    let mut task = vod_task("vod-encrypted");

    let state = engine
        .run(&mut task, Arc::new(RecordingSink::default()))
        .await
        .unwrap();
    assert_eq!(state, TaskState::Success, "{:?}", task.error_message);

    let dir = work_dir(temp.path(), &task);
    assert_eq!(
        tokio::fs::read(dir.join("segment_encryption.key")).await.unwrap(),
        b"0123456789abcdef"
    );
    assert_eq!(fixture.hits("keys/video.key"), 1);

    let playlist = tokio::fs::read_to_string(dir.join("video.m3u8")).await.unwrap();
    assert!(playlist.contains("#EXT-X-KEY:METHOD=AES-128,URI=\"segment_encryption.key\""));
    assert!(playlist.contains("segment_00002.ts"));
    assert!(playlist.trim_end().ends_with("#EXT-X-ENDLIST"));

    let args = remuxer.calls()[0].join(" ");
    assert!(args.contains("-allowed_extensions ALL"));
    assert!(args.contains("aac_adtstoasc"));
    assert_eq!(
        tokio::fs::read(task.output_path.unwrap()).await.unwrap(),
        expected
    );
}
