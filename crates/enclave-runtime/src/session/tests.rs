use super::*;
use crate::config::RuntimeConfig;
use crate::error::{CoreError, ErrorKind, InferenceError};
use crate::inference::{InferenceParams, StopReason, StreamEnd};
use crate::testing::{ScriptedBackend, runtime_with_model};
use std::sync::Arc;
use std::time::Duration;

fn slow() -> ScriptedBackend {
    ScriptedBackend::counting().with_delay(Duration::from_millis(5))
}

fn wait_for_state(session: &Session, state: SessionState) {
    for _ in 0..1000 {
        if session.state() == state {
            return;
        }
        std::thread::sleep(Duration::from_millis(1));
    }
    panic!("session never reached {state}");
}

#[test]
fn concurrent_call_on_one_session_fails_fast() {
    let (runtime, _) = runtime_with_model(RuntimeConfig::default(), slow());
    let session = Arc::new(runtime.create_session().unwrap());

    let worker = {
        let session = session.clone();
        std::thread::spawn(move || {
            session.infer(&InferenceParams::new(1, vec![1]).with_max_new_tokens(20))
        })
    };
    wait_for_state(&session, SessionState::InferenceRunning);

    let err = session
        .infer(&InferenceParams::new(1, vec![1]))
        .unwrap_err();
    assert!(err.is_busy());
    assert_eq!(err.kind(), ErrorKind::Inference);

    let result = worker.join().unwrap().unwrap();
    assert_eq!(result.token_count, 20);
    assert_eq!(session.state(), SessionState::Active);
}

#[test]
fn open_stream_keeps_the_session_busy() {
    let (runtime, _) = runtime_with_model(RuntimeConfig::default(), ScriptedBackend::counting());
    let session = runtime.create_session().unwrap();
    let params = InferenceParams::new(1, vec![1, 2, 3]).with_max_new_tokens(8);

    let mut stream = session.infer_streaming(&params).unwrap();
    assert!(matches!(
        session.infer(&params),
        Err(CoreError::Inference(InferenceError::SessionBusy(id))) if id == session.id()
    ));

    assert_eq!(stream.drain().unwrap().len(), 8);
    assert!(session.infer(&params).is_ok());
}

#[test]
fn cancel_mid_stream_then_infer_again() {
    let (runtime, backend) = runtime_with_model(RuntimeConfig::default(), slow());
    let session = runtime.create_session().unwrap();
    let params = InferenceParams::new(1, vec![1, 2, 3]).with_max_new_tokens(100);
    let expected = backend.expected(&[1, 2, 3], 100);

    let mut stream = session.infer_streaming(&params).unwrap();
    let mut received = Vec::new();
    for _ in 0..3 {
        received.push(stream.next().unwrap().unwrap().token);
    }
    assert!(session.cancel());

    let after_cancel: Vec<_> = stream.by_ref().collect();
    assert!(after_cancel.len() <= 1);
    for item in after_cancel {
        received.push(item.unwrap().token);
    }
    assert!(stream.next().is_none());
    assert_eq!(stream.end(), Some(StreamEnd::Cancelled));
    assert_eq!(received[..], expected[..received.len()]);

    assert_eq!(session.state(), SessionState::Active);
    let result = session
        .infer(&InferenceParams::new(1, vec![1]).with_max_new_tokens(2))
        .unwrap();
    assert_eq!(result.stop_reason, StopReason::LengthLimit);
}

#[test]
fn cancel_without_a_call_is_a_no_op() {
    let (runtime, _) = runtime_with_model(RuntimeConfig::default(), ScriptedBackend::counting());
    let session = runtime.create_session().unwrap();
    assert!(!session.cancel());
    assert_eq!(session.state(), SessionState::Active);
}

#[test]
fn cancel_interrupts_a_batch_call() {
    let (runtime, _) = runtime_with_model(RuntimeConfig::default(), slow());
    let session = Arc::new(runtime.create_session().unwrap());

    let worker = {
        let session = session.clone();
        std::thread::spawn(move || {
            session.infer(&InferenceParams::new(1, vec![1]).with_max_new_tokens(1000))
        })
    };
    wait_for_state(&session, SessionState::InferenceRunning);
    assert!(session.cancel());

    let err = worker.join().unwrap().unwrap_err();
    assert!(matches!(err, CoreError::Cancelled));
    assert_eq!(err.kind(), ErrorKind::Cancellation);
    assert_eq!(session.state(), SessionState::Active);
}

#[test]
fn destroy_with_an_unpolled_stream_releases_everything() {
    let (runtime, _) = runtime_with_model(RuntimeConfig::default(), ScriptedBackend::counting());
    let session = runtime.create_session().unwrap();
    let mut stream = session
        .infer_streaming(&InferenceParams::new(1, vec![1]).with_max_new_tokens(1000))
        .unwrap();

    session.destroy();
    assert_eq!(session.state(), SessionState::Destroyed);
    let stats = runtime.stats();
    assert_eq!(stats.live_arenas, 0);
    assert_eq!(stats.arena_bytes_in_use, 0);
    assert_eq!(stats.inferences_in_flight, 0);
    assert_eq!(runtime.session_count(), 0);

    assert!(stream.next().is_none());
    assert_eq!(stream.end(), Some(StreamEnd::Cancelled));
}

#[test]
fn destroy_interrupts_a_batch_call_and_is_idempotent() {
    let (runtime, _) = runtime_with_model(RuntimeConfig::default(), slow());
    let session = Arc::new(runtime.create_session().unwrap());

    let worker = {
        let session = session.clone();
        std::thread::spawn(move || {
            session.infer(&InferenceParams::new(1, vec![1]).with_max_new_tokens(1000))
        })
    };
    wait_for_state(&session, SessionState::InferenceRunning);

    session.destroy();
    assert_eq!(session.state(), SessionState::Destroyed);
    assert_eq!(runtime.stats().live_arenas, 0);
    assert_eq!(worker.join().unwrap().unwrap_err().kind(), ErrorKind::Cancellation);

    session.destroy();
    assert!(!runtime.destroy_session(session.id()));

    let err = session.infer(&InferenceParams::new(1, vec![1])).unwrap_err();
    assert!(matches!(err, CoreError::SessionClosed(_)));
}

#[test]
fn dropping_a_session_removes_it_from_the_runtime() {
    let (runtime, _) = runtime_with_model(RuntimeConfig::default(), ScriptedBackend::counting());
    let session = runtime.create_session().unwrap();
    let id = session.id();
    assert!(runtime.has_session(id));

    drop(session);
    assert!(!runtime.has_session(id));
    assert_eq!(runtime.session_count(), 0);
}

#[test]
fn sessions_run_in_parallel_with_private_arenas() {
    let (runtime, backend) = runtime_with_model(
        RuntimeConfig::default(),
        ScriptedBackend::counting().with_delay(Duration::from_millis(1)),
    );
    let runtime = Arc::new(runtime);

    let workers: Vec<_> = (0..4u32)
        .map(|i| {
            let runtime = runtime.clone();
            std::thread::spawn(move || {
                let session = runtime.create_session().unwrap();
                let prompt = vec![100 * (i + 1)];
                session
                    .infer(&InferenceParams::new(1, prompt).with_max_new_tokens(25))
                    .unwrap()
            })
        })
        .collect();

    for (i, worker) in workers.into_iter().enumerate() {
        let result = worker.join().unwrap();
        let prompt = [100 * (i as u32 + 1)];
        assert_eq!(result.tokens, backend.expected(&prompt, 25));
    }
    assert_eq!(runtime.stats().live_arenas, 0);
    assert_eq!(runtime.session_count(), 0);
}

#[tokio::test]
async fn async_session_infers_and_streams() {
    let (runtime, backend) =
        runtime_with_model(RuntimeConfig::default(), ScriptedBackend::counting());
    let session = runtime.create_async_session().unwrap();
    let params = InferenceParams::new(1, vec![1, 2, 3]).with_max_new_tokens(5);

    let result = session.infer(&params).await.unwrap();
    assert_eq!(result.tokens, backend.expected(&[1, 2, 3], 5));

    let mut stream = session.infer_streaming(&params).await.unwrap();
    let chunks = stream.drain().await.unwrap();
    let tokens: Vec<u32> = chunks.iter().map(|c| c.token).collect();
    assert_eq!(tokens, result.tokens);
    assert_eq!(session.state(), SessionState::Active);

    session.destroy().await;
    assert_eq!(session.state(), SessionState::Destroyed);
    assert_eq!(runtime.session_count(), 0);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn async_session_cancel_is_a_prefix_and_recovers() {
    let (runtime, backend) = runtime_with_model(RuntimeConfig::default(), slow());
    let session = runtime.create_async_session().unwrap();
    let params = InferenceParams::new(1, vec![1, 2, 3]).with_max_new_tokens(100);
    let expected = backend.expected(&[1, 2, 3], 100);

    let mut stream = session.infer_streaming(&params).await.unwrap();
    let mut received = Vec::new();
    while let Some(item) = stream.next().await {
        received.push(item.unwrap().token);
        if received.len() == 3 {
            session.cancel();
        }
    }
    assert_eq!(received.len(), 3);
    assert_eq!(received[..], expected[..3]);

    let result = session
        .infer(&InferenceParams::new(1, vec![7]).with_max_new_tokens(2))
        .await
        .unwrap();
    assert_eq!(result.tokens, vec![8, 9]);
}

#[tokio::test]
async fn async_destroy_waits_for_a_running_stream() {
    let (runtime, _) = runtime_with_model(RuntimeConfig::default(), slow());
    let session = runtime.create_async_session().unwrap();
    let mut stream = session
        .infer_streaming(&InferenceParams::new(1, vec![1]).with_max_new_tokens(1000))
        .await
        .unwrap();
    assert!(stream.next().await.unwrap().is_ok());

    session.destroy().await;
    let stats = runtime.stats();
    assert_eq!(stats.live_arenas, 0);
    assert_eq!(stats.live_sessions, 0);
    assert!(stream.next().await.is_none());

    drop(session);
    drop(runtime);
}

#[tokio::test]
async fn async_concurrent_call_on_one_session_fails_fast() {
    let (runtime, _) = runtime_with_model(RuntimeConfig::default(), slow());
    let session = runtime.create_async_session().unwrap();
    let long = InferenceParams::new(1, vec![1]).with_max_new_tokens(20);
    let short = InferenceParams::new(1, vec![1]);

    let (first, second) = tokio::join!(session.infer(&long), async {
        while session.state() != SessionState::InferenceRunning {
            tokio::time::sleep(Duration::from_millis(1)).await;
        }
        session.infer(&short).await
    });

    let err = second.unwrap_err();
    assert!(err.is_busy());
    assert_eq!(err.kind(), ErrorKind::Inference);
    assert_eq!(first.unwrap().token_count, 20);
    assert_eq!(session.state(), SessionState::Active);
}

#[tokio::test]
async fn async_infer_times_out_and_frees_the_session() {
    let (runtime, _) = runtime_with_model(
        RuntimeConfig::default(),
        ScriptedBackend::counting().with_delay(Duration::from_millis(20)),
    );
    let session = runtime.create_async_session().unwrap();

    let err = session
        .infer(
            &InferenceParams::new(1, vec![1])
                .with_max_new_tokens(100)
                .with_timeout(Duration::from_millis(1)),
        )
        .await
        .unwrap_err();
    assert!(matches!(err, CoreError::Timeout(d) if d == Duration::from_millis(1)));
    assert!(err.is_retryable());
    assert_eq!(session.state(), SessionState::Active);
    assert_eq!(runtime.stats().live_arenas, 0);

    let result = session
        .infer(&InferenceParams::new(1, vec![1]).with_max_new_tokens(2))
        .await
        .unwrap();
    assert_eq!(result.tokens, vec![2, 3]);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn dropping_an_async_session_destroys_it_in_the_background() {
    let (runtime, _) = runtime_with_model(RuntimeConfig::default(), ScriptedBackend::counting());
    let session = runtime.create_async_session().unwrap();
    drop(session);

    for _ in 0..100 {
        if runtime.session_count() == 0 {
            return;
        }
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
    panic!("dropped async session was never destroyed");
}
