//! Session and engine-wide error handling

#[path = "../fixtures/fake_hardware.rs"]
mod fake_hardware;

use std::time::Duration;

use fake_hardware::{
    drain_events, eventually, fast_config, handle_of, next_event, scratch, Command, Harness,
};
use vidc_core::hfi::{RestartKind, SessionHandle, SessionMessage};
use vidc_core::{
    Codec, CoreState, Error, FlushScope, InstanceEvent, InstanceState, Port, PortMask, Response,
    ResponseKind, SessionConfig, SessionType, VideoBuffer,
};

fn frame(id: u64) -> VideoBuffer {
    VideoBuffer::new(id, id << 20, 1 << 20).with_payload(1024, 0)
}

#[tokio::test]
async fn test_session_error_is_isolated() {
    let h = Harness::new(fast_config());
    let config = SessionConfig::decoder(Codec::H264, 1920, 1080).with_fps(30);
    let (a, mut a_events) = h.core.open_instance(config.clone()).unwrap();
    let (b, mut b_events) = h.core.open_instance(config).unwrap();
    a.try_state(InstanceState::StartDone).await.unwrap();
    b.try_state(InstanceState::StartDone).await.unwrap();

    h.hw.send_session(handle_of(&a), SessionMessage::Error { code: 0x1009 });

    assert_eq!(
        next_event(&mut a_events).await,
        InstanceEvent::SessionError { code: 0x1009 }
    );
    assert_eq!(a.state(), InstanceState::Invalid);
    assert_eq!(b.state(), InstanceState::StartDone);
    assert_eq!(h.core.state(), CoreState::InitDone);
    assert!(eventually(|| h.hw.clock_votes().last() == Some(&243_000)).await);

    // a repeated report does not notify twice
    h.hw.send_session(SessionHandle(a.id()), SessionMessage::Error { code: 0x1009 });
    b.submit_buffer(frame(1), Port::Input).await.unwrap();
    assert!(eventually(|| h.hw.count("submit_input") == 1).await);
    tokio::time::sleep(Duration::from_millis(20)).await;
    assert!(drain_events(&mut a_events).is_empty());
    assert!(drain_events(&mut b_events).is_empty());
}

#[tokio::test]
async fn test_watchdog_invalidates_every_instance_once() {
    let h = Harness::new(fast_config());
    let (a, mut a_events) = h
        .core
        .open_instance(SessionConfig::decoder(Codec::Hevc, 1280, 720))
        .unwrap();
    let (b, mut b_events) = h
        .core
        .open_instance(SessionConfig::encoder(Codec::H264, 1280, 720))
        .unwrap();
    a.try_state(InstanceState::StartDone).await.unwrap();
    b.try_state(InstanceState::OpenDone).await.unwrap();

    h.hw.send(Response::WatchdogTimeout);

    assert_eq!(
        next_event(&mut a_events).await,
        InstanceEvent::SysError { code: None }
    );
    assert_eq!(
        next_event(&mut b_events).await,
        InstanceEvent::SysError { code: None }
    );
    assert_eq!(h.core.state(), CoreState::Invalid);
    assert_eq!(a.state(), InstanceState::Invalid);
    assert_eq!(b.state(), InstanceState::Invalid);

    h.hw.send(Response::SysError { code: 7 });
    tokio::time::sleep(Duration::from_millis(20)).await;
    assert!(drain_events(&mut a_events).is_empty());
    assert!(drain_events(&mut b_events).is_empty());
    assert_eq!(h.core.state(), CoreState::Invalid);
}

#[tokio::test]
async fn test_invalid_instance_refuses_transitions_without_commands() {
    let h = Harness::new(fast_config());
    let (session, _events) = h
        .core
        .open_instance(SessionConfig::decoder(Codec::H264, 640, 480))
        .unwrap();
    session.try_state(InstanceState::StartDone).await.unwrap();
    h.hw.send_session(handle_of(&session), SessionMessage::Error { code: 1 });
    assert!(eventually(|| session.state() == InstanceState::Invalid).await);
    h.hw.clear();

    for target in [InstanceState::StopDone, InstanceState::CloseDone] {
        let err = session.try_state(target).await.unwrap_err();
        assert!(matches!(
            err,
            Error::InvalidState {
                state: InstanceState::Invalid,
                ..
            }
        ));
        assert!(err.is_fatal());
    }
    let err = session.submit_buffer(frame(1), Port::Input).await.unwrap_err();
    assert!(err.is_fatal());
    assert!(h.hw.commands().is_empty());
}

#[tokio::test]
async fn test_blocked_waiter_woken_by_engine_failure() {
    let h = Harness::new(fast_config().with_hw_response_timeout(Duration::from_secs(5)));
    let (session, _events) = h
        .core
        .open_instance(SessionConfig::decoder(Codec::Vp9, 1920, 1080))
        .unwrap();
    session.try_state(InstanceState::LoadResourcesDone).await.unwrap();
    h.hw.silence("start_session");

    let waiter = {
        let session = session.clone();
        tokio::spawn(async move { session.try_state(InstanceState::StartDone).await })
    };
    assert!(eventually(|| session.state() == InstanceState::Start).await);

    h.hw.send(Response::SysError { code: 3 });

    let result = tokio::time::timeout(Duration::from_secs(1), waiter)
        .await
        .expect("waiter woken promptly")
        .expect("waiter task");
    assert!(matches!(
        result,
        Err(Error::SessionInvalidated {
            kind: ResponseKind::StartDone
        })
    ));
    assert_eq!(session.state(), InstanceState::Invalid);
}

#[tokio::test]
async fn test_force_cleanup_returns_everything() {
    let h = Harness::new(fast_config());
    h.hw.set_requirements(vec![scratch(2, 4096)]);
    let (session, mut events) = h
        .core
        .open_instance(SessionConfig::decoder(Codec::H264, 1920, 1080))
        .unwrap();
    session.try_state(InstanceState::OpenDone).await.unwrap();
    session.allocate_scratch_buffers().await.unwrap();
    session.submit_buffer(frame(1), Port::Input).await.unwrap();
    session.submit_buffer(frame(2), Port::Output).await.unwrap();
    let handle = handle_of(&session);

    h.hw.send_session(handle, SessionMessage::Error { code: 9 });
    assert_eq!(
        next_event(&mut events).await,
        InstanceEvent::SessionError { code: 9 }
    );
    h.hw.clear();

    session.close().await.unwrap();

    let returned: Vec<_> = drain_events(&mut events)
        .into_iter()
        .map(|event| match event {
            InstanceEvent::BufferReturned { port, buffer } => (port, buffer.id),
            other => panic!("unexpected event {other:?}"),
        })
        .collect();
    assert_eq!(returned, vec![(Port::Input, 1), (Port::Output, 2)]);

    assert_eq!(h.hw.count("release_buffer"), 2);
    assert!(h.hw.commands().contains(&Command::EndSession(handle)));
    assert_eq!(h.allocator.metrics().regions_active, 0);
    assert_eq!(session.state(), InstanceState::CloseDone);
    assert_eq!(h.core.instance_count(), 0);
    assert_eq!(h.core.state(), CoreState::Uninit);
}

#[tokio::test]
async fn test_flush_on_invalid_instance_is_local() {
    let h = Harness::new(fast_config());
    let (session, mut events) = h
        .core
        .open_instance(SessionConfig::decoder(Codec::H264, 1280, 720))
        .unwrap();
    session.try_state(InstanceState::StartDone).await.unwrap();
    session.submit_buffer(frame(5), Port::Output).await.unwrap();
    h.hw.send(Response::WatchdogTimeout);
    assert_eq!(
        next_event(&mut events).await,
        InstanceEvent::SysError { code: None }
    );
    h.hw.clear();

    session.flush(PortMask::OUTPUT).await.unwrap();

    assert!(h.hw.commands().is_empty());
    match next_event(&mut events).await {
        InstanceEvent::BufferReturned { port, buffer } => {
            assert_eq!(port, Port::Output);
            assert_eq!(buffer.id, 5);
        }
        other => panic!("unexpected event {other:?}"),
    }
    assert_eq!(
        next_event(&mut events).await,
        InstanceEvent::FlushDone {
            scope: FlushScope::Output
        }
    );
}

#[tokio::test]
async fn test_subsystem_restart_requires_initialized_core() {
    let h = Harness::new(fast_config());
    let err = h
        .core
        .trigger_subsystem_restart(RestartKind::Watchdog)
        .await
        .unwrap_err();
    assert!(matches!(
        err,
        Error::CoreUnavailable {
            state: CoreState::Uninit,
            ..
        }
    ));
    assert_eq!(h.hw.count("trigger_subsystem_restart"), 0);

    let (session, mut events) = h
        .core
        .open_instance(SessionConfig::encoder(Codec::H264, 1280, 720))
        .unwrap();
    session.try_state(InstanceState::OpenDone).await.unwrap();
    h.core
        .trigger_subsystem_restart(RestartKind::Fatal)
        .await
        .unwrap();

    assert!(h
        .hw
        .commands()
        .contains(&Command::TriggerRestart(RestartKind::Fatal)));
    assert_eq!(
        next_event(&mut events).await,
        InstanceEvent::SysError { code: None }
    );
    assert_eq!(h.core.state(), CoreState::Invalid);

    let err = h
        .core
        .trigger_subsystem_restart(RestartKind::Fatal)
        .await
        .unwrap_err();
    assert!(err.is_fatal());
}

#[tokio::test]
async fn test_invalid_core_skips_orderly_on_chip_release() {
    let h = Harness::new(fast_config().with_on_chip_memory(true));
    let (session, mut events) = h
        .core
        .open_instance(SessionConfig::decoder(Codec::H264, 1920, 1080))
        .unwrap();
    session.try_state(InstanceState::StartDone).await.unwrap();
    assert!(h.core.on_chip_memory().is_some());

    h.hw.send(Response::WatchdogTimeout);
    next_event(&mut events).await;
    h.hw.clear();

    session.close().await.unwrap();

    assert_eq!(h.hw.count("release_on_chip_memory"), 0);
    assert_eq!(h.hw.count("free_on_chip_memory"), 1);
    assert_eq!(h.hw.count("release_core"), 1);
    assert_eq!(h.hw.count("unload_firmware"), 1);
    assert_eq!(h.core.state(), CoreState::Uninit);
    assert_eq!(h.core.on_chip_memory(), None);
}

#[tokio::test]
async fn test_invalid_core_refuses_new_sessions_until_released() {
    let h = Harness::new(fast_config());
    let (session, _events) = h
        .core
        .open_instance(SessionConfig::decoder(Codec::H264, 640, 480))
        .unwrap();
    session.try_state(InstanceState::OpenDone).await.unwrap();
    h.hw.send(Response::SysError { code: 1 });
    assert!(eventually(|| h.core.state() == CoreState::Invalid).await);

    let err = h
        .core
        .open_instance(SessionConfig::encoder(Codec::H264, 640, 480))
        .unwrap_err();
    assert!(matches!(
        err,
        Error::CoreUnavailable {
            state: CoreState::Invalid,
            ..
        }
    ));
    assert_eq!(h.core.load(SessionType::Decoder), 0);

    session.close().await.unwrap();
    assert_eq!(h.core.state(), CoreState::Uninit);

    let (fresh, _fresh_events) = h
        .core
        .open_instance(SessionConfig::encoder(Codec::H264, 640, 480))
        .unwrap();
    fresh.try_state(InstanceState::StartDone).await.unwrap();
    assert_eq!(h.core.state(), CoreState::InitDone);
    assert_eq!(h.hw.count("init_core"), 2);
}

#[tokio::test]
async fn test_force_cleanup_does_not_wait_out_core_init() {
    let h = Harness::new(fast_config().with_hw_response_timeout(Duration::from_secs(5)));
    h.hw.silence("init_core");
    let (session, _events) = h
        .core
        .open_instance(SessionConfig::decoder(Codec::H264, 1920, 1080))
        .unwrap();

    let walker = {
        let session = session.clone();
        tokio::spawn(async move { session.try_state(InstanceState::OpenDone).await })
    };
    assert!(eventually(|| h.hw.count("init_core") == 1).await);
    assert_eq!(session.state(), InstanceState::CoreInit);

    tokio::time::timeout(Duration::from_secs(1), session.force_cleanup())
        .await
        .expect("cleanup without waiting on the engine")
        .unwrap();

    let result = tokio::time::timeout(Duration::from_secs(1), walker)
        .await
        .expect("walker woken promptly")
        .expect("walker task");
    assert!(result.is_err());
    assert_eq!(session.state(), InstanceState::CloseDone);
    assert_eq!(h.core.instance_count(), 0);
    assert!(eventually(|| h.core.state() == CoreState::Uninit).await);
    assert_eq!(h.hw.count("release_core"), 1);
    assert_eq!(h.hw.count("init_session"), 0);
}

#[tokio::test]
async fn test_force_cleanup_wakes_walker_mid_ladder() {
    let h = Harness::new(fast_config().with_hw_response_timeout(Duration::from_secs(5)));
    let (session, _events) = h
        .core
        .open_instance(SessionConfig::decoder(Codec::Hevc, 1280, 720))
        .unwrap();
    session.try_state(InstanceState::OpenDone).await.unwrap();
    h.hw.silence("start_session");

    let walker = {
        let session = session.clone();
        tokio::spawn(async move { session.try_state(InstanceState::StartDone).await })
    };
    assert!(eventually(|| session.state() == InstanceState::Start).await);

    tokio::time::timeout(Duration::from_secs(1), session.force_cleanup())
        .await
        .expect("cleanup without waiting on the engine")
        .unwrap();

    let result = tokio::time::timeout(Duration::from_secs(1), walker)
        .await
        .expect("walker woken promptly")
        .expect("walker task");
    assert!(matches!(
        result,
        Err(Error::SessionInvalidated {
            kind: ResponseKind::StartDone
        })
    ));
    assert_eq!(session.state(), InstanceState::CloseDone);
    assert_eq!(h.core.state(), CoreState::Uninit);

    // nothing is walked once cleaned up
    h.hw.clear();
    let err = session
        .try_state(InstanceState::StopDone)
        .await
        .unwrap_err();
    assert!(matches!(err, Error::InvalidState { .. }));
    assert!(h.hw.commands().is_empty());
}

#[tokio::test]
async fn test_fatal_error_on_idle_core_releases_it() {
    let h = Harness::new(fast_config());
    h.core.init().await.unwrap();
    assert_eq!(h.core.state(), CoreState::InitDone);

    h.hw.send(Response::WatchdogTimeout);

    assert!(eventually(|| h.core.state() == CoreState::Uninit).await);
    assert_eq!(h.hw.count("release_core"), 1);
    assert_eq!(h.hw.count("unload_firmware"), 1);
    assert_eq!(h.hw.clock_votes().last(), Some(&0));

    let (session, _events) = h
        .core
        .open_instance(SessionConfig::decoder(Codec::H264, 640, 480))
        .unwrap();
    session.try_state(InstanceState::StartDone).await.unwrap();
    assert_eq!(h.hw.count("init_core"), 2);
}

#[tokio::test]
async fn test_fatal_error_on_uninitialized_core_is_ignored() {
    let h = Harness::new(fast_config());

    h.hw.send(Response::SysError { code: 2 });
    tokio::time::sleep(Duration::from_millis(20)).await;

    assert_eq!(h.core.state(), CoreState::Uninit);
    assert!(h.hw.commands().is_empty());
}

#[tokio::test]
async fn test_stalled_revote_does_not_hold_up_responses() {
    let h = Harness::new(fast_config());
    let config = SessionConfig::decoder(Codec::H264, 1920, 1080).with_fps(30);
    let (a, _a_events) = h.core.open_instance(config.clone()).unwrap();
    let (b, _b_events) = h.core.open_instance(config).unwrap();
    a.try_state(InstanceState::StartDone).await.unwrap();
    b.try_state(InstanceState::OpenDone).await.unwrap();
    assert_eq!(h.hw.clock_votes().last(), Some(&486_000));

    h.hw.stall_clock_votes();
    h.hw.send_session(handle_of(&a), SessionMessage::Error { code: 4 });
    assert!(eventually(|| h.hw.clock_votes().last() == Some(&243_000)).await);

    // the re-vote is parked in the engine; b's acknowledgements still arrive
    let b_step = {
        let b = b.clone();
        tokio::spawn(async move { b.try_state(InstanceState::LoadResourcesDone).await })
    };
    assert!(eventually(|| b.state() == InstanceState::LoadResourcesDone).await);

    h.hw.resume_clock_votes();
    tokio::time::timeout(Duration::from_secs(1), b_step)
        .await
        .expect("step finishes once votes resume")
        .expect("step task")
        .unwrap();
    assert_eq!(a.state(), InstanceState::Invalid);
}
