//! Caller buffer submission, flush and internal buffer management

#[path = "../fixtures/fake_hardware.rs"]
mod fake_hardware;

use fake_hardware::{
    drain_events, eventually, fast_config, handle_of, next_event, persist, scratch, Command,
    Harness,
};
use vidc_core::hfi::{BufferDone, BufferKind, PortChange, SessionMessage};
use vidc_core::{
    BufferAllocator, Codec, Error, FlushScope, FrameFlags, InstanceEvent, InstanceState, Port,
    PortMask, Property, SessionConfig, SessionType, VideoBuffer,
};

fn frame(id: u64) -> VideoBuffer {
    VideoBuffer::new(id, 0x4000_0000 + id * 0x10_0000, 1 << 20).with_payload(4096, id as i64 * 33_333)
}

fn done(id: u64, timestamp_us: i64) -> BufferDone {
    BufferDone {
        buffer_id: id,
        filled_len: 2048,
        offset: 0,
        timestamp_us,
        flags: FrameFlags::empty(),
    }
}

#[tokio::test]
async fn test_buffers_queue_until_started_then_drain_in_order() {
    let h = Harness::new(fast_config());
    let (session, _events) = h
        .core
        .open_instance(SessionConfig::decoder(Codec::H264, 1920, 1080))
        .unwrap();
    session.try_state(InstanceState::OpenDone).await.unwrap();
    h.hw.clear();

    for id in 1..=3 {
        session.submit_buffer(frame(id), Port::Input).await.unwrap();
    }
    assert_eq!(session.pending_len(), 3);
    assert!(h.hw.commands().is_empty());

    session.try_state(InstanceState::StartDone).await.unwrap();

    let handle = handle_of(&session);
    let forwarded: Vec<_> = h
        .hw
        .commands()
        .into_iter()
        .filter(|c| c.name() == "submit_input")
        .collect();
    assert_eq!(
        forwarded,
        vec![
            Command::SubmitInput(handle, 1),
            Command::SubmitInput(handle, 2),
            Command::SubmitInput(handle, 3),
        ]
    );
    assert_eq!(session.pending_len(), 0);
    assert_eq!(session.stats().inputs_submitted, 3);
}

#[tokio::test]
async fn test_running_session_forwards_each_buffer_once() {
    let h = Harness::new(fast_config());
    let (session, mut events) = h
        .core
        .open_instance(SessionConfig::decoder(Codec::Vp9, 1280, 720))
        .unwrap();
    session.try_state(InstanceState::StartDone).await.unwrap();
    let handle = handle_of(&session);
    h.hw.clear();

    session.submit_buffer(frame(10), Port::Input).await.unwrap();
    session.submit_buffer(frame(20), Port::Output).await.unwrap();
    assert_eq!(
        h.hw.commands(),
        vec![
            Command::SubmitInput(handle, 10),
            Command::SubmitOutput(handle, 20)
        ]
    );

    h.hw.send_session(handle, SessionMessage::InputBufferDone(done(10, 0)));
    match next_event(&mut events).await {
        InstanceEvent::InputDone(buffer) => {
            assert_eq!(buffer.id, 10);
            assert_eq!(buffer.filled_len, 2048);
        }
        other => panic!("unexpected event {other:?}"),
    }
    let stats = session.stats();
    assert_eq!(stats.inputs_done, 1);
    assert_eq!(stats.outputs_submitted, 1);
}

#[tokio::test]
async fn test_encoder_first_output_requests_sequence_header() {
    let h = Harness::new(fast_config());
    let (session, mut events) = h
        .core
        .open_instance(SessionConfig::encoder(Codec::Hevc, 1920, 1080))
        .unwrap();
    session.try_state(InstanceState::StartDone).await.unwrap();
    let handle = handle_of(&session);
    h.hw.clear();

    session.submit_buffer(frame(1), Port::Output).await.unwrap();
    assert_eq!(h.hw.commands(), vec![Command::GetSequenceHeader(handle, 1)]);

    match next_event(&mut events).await {
        InstanceEvent::OutputDone(buffer) => {
            assert_eq!(buffer.id, 1);
            assert!(buffer.flags.contains(FrameFlags::CODEC_CONFIG));
        }
        other => panic!("unexpected event {other:?}"),
    }

    session.submit_buffer(frame(2), Port::Output).await.unwrap();
    assert_eq!(h.hw.count("submit_output"), 1);
    assert_eq!(h.hw.count("get_sequence_header"), 1);
}

#[tokio::test]
async fn test_input_only_flush_is_rejected_without_side_effects() {
    let h = Harness::new(fast_config());
    let (session, mut events) = h
        .core
        .open_instance(SessionConfig::decoder(Codec::H264, 640, 480))
        .unwrap();
    session.try_state(InstanceState::OpenDone).await.unwrap();
    session.submit_buffer(frame(1), Port::Input).await.unwrap();
    h.hw.clear();

    let err = session.flush(PortMask::INPUT).await.unwrap_err();

    assert!(matches!(err, Error::NotSupported(_)));
    assert_eq!(session.pending_len(), 1);
    assert!(h.hw.commands().is_empty());
    assert!(drain_events(&mut events).is_empty());
}

#[tokio::test]
async fn test_flush_returns_queued_buffers_then_flushes_hardware() {
    let h = Harness::new(fast_config());
    let (session, mut events) = h
        .core
        .open_instance(SessionConfig::decoder(Codec::H264, 640, 480))
        .unwrap();
    session.try_state(InstanceState::OpenDone).await.unwrap();
    session.submit_buffer(frame(1), Port::Input).await.unwrap();
    session.submit_buffer(frame(2), Port::Output).await.unwrap();
    let handle = handle_of(&session);

    session
        .flush(PortMask::INPUT | PortMask::OUTPUT)
        .await
        .unwrap();

    assert_eq!(session.pending_len(), 0);
    assert_eq!(h.hw.count("submit_input"), 0);
    assert!(h.hw.commands().contains(&Command::Flush(handle, FlushScope::All)));

    let mut returned = Vec::new();
    loop {
        match next_event(&mut events).await {
            InstanceEvent::BufferReturned { port, buffer } => returned.push((port, buffer.id)),
            InstanceEvent::FlushDone { scope } => {
                assert_eq!(scope, FlushScope::All);
                break;
            }
            other => panic!("unexpected event {other:?}"),
        }
    }
    assert_eq!(returned, vec![(Port::Input, 1), (Port::Output, 2)]);
}

#[tokio::test]
async fn test_output_flush_keeps_queued_input() {
    let h = Harness::new(fast_config());
    let (session, _events) = h
        .core
        .open_instance(SessionConfig::decoder(Codec::H264, 640, 480))
        .unwrap();
    session.try_state(InstanceState::OpenDone).await.unwrap();
    session.submit_buffer(frame(1), Port::Input).await.unwrap();
    session.submit_buffer(frame(2), Port::Output).await.unwrap();

    session.flush(PortMask::OUTPUT).await.unwrap();

    assert_eq!(session.pending_len(), 1);
    assert!(h
        .hw
        .commands()
        .contains(&Command::Flush(handle_of(&session), FlushScope::Output)));
}

#[tokio::test]
async fn test_port_reconfiguration_cleared_by_output_flush() {
    let h = Harness::new(fast_config());
    let (session, mut events) = h
        .core
        .open_instance(SessionConfig::decoder(Codec::Hevc, 1280, 720))
        .unwrap();
    session.try_state(InstanceState::StartDone).await.unwrap();
    let handle = handle_of(&session);

    let change = PortChange {
        width: 1920,
        height: 1088,
        sufficient: false,
    };
    h.hw.send_session(handle, SessionMessage::EventChange(change));
    assert_eq!(
        next_event(&mut events).await,
        InstanceEvent::PortSettingsChanged(change)
    );
    assert!(session.in_reconfig());
    assert_eq!(session.dimensions(), (1920, 1088));

    session.flush(PortMask::OUTPUT).await.unwrap();
    assert_eq!(
        next_event(&mut events).await,
        InstanceEvent::FlushDone {
            scope: FlushScope::Output
        }
    );
    assert!(!session.in_reconfig());
}

#[tokio::test]
async fn test_scratch_allocate_release_reallocate() {
    let h = Harness::new(fast_config());
    h.hw.set_requirements(vec![scratch(3, 64 * 1024), persist(1, 8192)]);
    let (session, _events) = h
        .core
        .open_instance(SessionConfig::decoder(Codec::H264, 1920, 1080))
        .unwrap();
    session.try_state(InstanceState::OpenDone).await.unwrap();

    for _ in 0..2 {
        assert_eq!(session.allocate_scratch_buffers().await.unwrap(), 3);
        let held = session.internal_buffers(BufferKind::Scratch);
        assert_eq!(held.len(), 3);
        assert!(held.iter().all(|b| b.memory.size == 64 * 1024));
        assert_eq!(h.allocator.metrics().regions_active, 3);

        session.release_scratch_buffers().await.unwrap();
        assert!(session.internal_buffers(BufferKind::Scratch).is_empty());
        assert_eq!(h.allocator.metrics().regions_active, 0);
    }
    assert_eq!(h.hw.count("register_buffer"), 6);
    assert_eq!(h.hw.count("release_buffer"), 6);
}

#[tokio::test]
async fn test_reallocation_replaces_previous_buffers() {
    let h = Harness::new(fast_config());
    h.hw.set_requirements(vec![scratch(2, 4096)]);
    let (session, _events) = h
        .core
        .open_instance(SessionConfig::decoder(Codec::H264, 1920, 1080))
        .unwrap();
    session.try_state(InstanceState::OpenDone).await.unwrap();

    session.allocate_scratch_buffers().await.unwrap();
    h.hw.set_requirements(vec![scratch(4, 8192)]);
    session.allocate_scratch_buffers().await.unwrap();

    let held = session.internal_buffers(BufferKind::Scratch);
    assert_eq!(held.len(), 4);
    assert!(held.iter().all(|b| b.memory.size == 8192));
    assert_eq!(h.hw.count("release_buffer"), 2);
    assert_eq!(h.allocator.metrics().regions_active, 4);
}

#[tokio::test]
async fn test_failed_allocation_unwinds_only_this_call() {
    let h = Harness::new(fast_config());
    h.hw.set_requirements(vec![scratch(3, 4096), persist(2, 1024)]);
    let (session, _events) = h
        .core
        .open_instance(SessionConfig::decoder(Codec::H264, 1920, 1080))
        .unwrap();
    session.try_state(InstanceState::OpenDone).await.unwrap();
    assert_eq!(session.allocate_persist_buffers().await.unwrap(), 2);

    h.hw.limit_registrations(1);
    let err = session.allocate_scratch_buffers().await.unwrap_err();

    assert!(matches!(err, Error::CommandRejected { command: "register_buffer", .. }));
    assert!(session.internal_buffers(BufferKind::Scratch).is_empty());
    assert_eq!(session.internal_buffers(BufferKind::Persist).len(), 2);
    assert_eq!(h.allocator.metrics().regions_active, 2);
    assert_eq!(h.allocator.kind_usage(BufferKind::Scratch), 0);
}

#[tokio::test]
async fn test_oversized_requirement_count_fails_cleanly() {
    let h = Harness::new(fast_config());
    h.hw.set_requirements(vec![scratch(u32::MAX, 64 << 20)]);
    let (session, _events) = h
        .core
        .open_instance(SessionConfig::decoder(Codec::H264, 1920, 1080))
        .unwrap();
    session.try_state(InstanceState::OpenDone).await.unwrap();

    let err = session.allocate_scratch_buffers().await.unwrap_err();

    assert!(matches!(err, Error::AllocationFailed(_)));
    assert_eq!(h.hw.count("register_buffer"), 8);
    assert!(session.internal_buffers(BufferKind::Scratch).is_empty());
    assert_eq!(h.allocator.metrics().regions_active, 0);
}

#[tokio::test]
async fn test_internal_buffers_released_on_close() {
    let h = Harness::new(fast_config());
    h.hw.set_requirements(vec![scratch(2, 4096), persist(1, 4096)]);
    let (session, _events) = h
        .core
        .open_instance(SessionConfig::decoder(Codec::H264, 1920, 1080))
        .unwrap();
    session.try_state(InstanceState::OpenDone).await.unwrap();
    session.allocate_scratch_buffers().await.unwrap();
    session.allocate_persist_buffers().await.unwrap();
    let handle = handle_of(&session);
    h.hw.clear();

    session.close().await.unwrap();

    let actions: Vec<_> = h.hw.actions().into_iter().map(|c| c.name()).collect();
    let end = actions.iter().position(|n| *n == "end_session").unwrap();
    assert_eq!(
        actions[..end].iter().filter(|n| **n == "release_buffer").count(),
        3
    );
    assert!(h.hw.actions().contains(&Command::EndSession(handle)));
    assert_eq!(h.allocator.metrics().regions_active, 0);
}

#[tokio::test]
async fn test_buffer_requirements_need_a_session() {
    let h = Harness::new(fast_config());
    h.hw.set_requirements(vec![scratch(2, 4096)]);
    let (session, _events) = h
        .core
        .open_instance(SessionConfig::decoder(Codec::H264, 1920, 1080))
        .unwrap();

    let err = session.query_buffer_requirements().await.unwrap_err();
    assert!(matches!(err, Error::InvalidState { .. }));
    assert_eq!(h.hw.count("get_buffer_requirements"), 0);

    session.try_state(InstanceState::OpenDone).await.unwrap();
    let requirements = session.query_buffer_requirements().await.unwrap();
    assert_eq!(requirements, vec![scratch(2, 4096)]);
    assert_eq!(session.buffer_requirements(), requirements);
}

#[tokio::test]
async fn test_set_property_range_and_local_effect() {
    let h = Harness::new(fast_config());
    let (session, _events) = h
        .core
        .open_instance(SessionConfig::decoder(Codec::H264, 1920, 1080).with_fps(30))
        .unwrap();

    let err = session
        .set_property(Property::FrameRate(60))
        .await
        .unwrap_err();
    assert!(matches!(err, Error::InvalidState { .. }));
    assert_eq!(h.hw.count("set_property"), 0);

    session.try_state(InstanceState::OpenDone).await.unwrap();
    session.set_property(Property::FrameRate(60)).await.unwrap();
    session.set_property(Property::Bitrate(8_000_000)).await.unwrap();

    assert_eq!(session.fps(), 60);
    assert_eq!(h.hw.count("set_property"), 2);
    assert_eq!(h.core.load(SessionType::Decoder), 486_000);
    assert_eq!(h.hw.clock_votes().last(), Some(&486_000));

    let err = session
        .set_property(Property::FrameSize {
            width: 0,
            height: 720,
        })
        .await
        .unwrap_err();
    assert!(matches!(err, Error::InvalidArgument(_)));
}

#[tokio::test]
async fn test_frame_size_bounds_are_enforced() {
    let h = Harness::new(fast_config());
    let err = h
        .core
        .open_instance(SessionConfig::decoder(Codec::H264, 20_000, 1080))
        .unwrap_err();
    assert!(matches!(err, Error::InvalidArgument(_)));

    let (session, _events) = h
        .core
        .open_instance(SessionConfig::decoder(Codec::H264, 1920, 1080).with_fps(30))
        .unwrap();
    session.try_state(InstanceState::StartDone).await.unwrap();
    h.hw.clear();

    let err = session
        .set_property(Property::FrameSize {
            width: u32::MAX,
            height: u32::MAX,
        })
        .await
        .unwrap_err();
    assert!(matches!(err, Error::InvalidArgument(_)));
    assert_eq!(h.hw.count("set_property"), 0);
    assert_eq!(h.core.load(SessionType::Decoder), 243_000);

    // the engine is not range checked, but the load it implies saturates
    let change = PortChange {
        width: u32::MAX,
        height: u32::MAX,
        sufficient: false,
    };
    h.hw.send_session(handle_of(&session), SessionMessage::EventChange(change));
    assert!(eventually(|| h.core.load(SessionType::Decoder) == u64::MAX / 256).await);
    assert_eq!(h.core.total_load(), u64::MAX / 256);
}

#[tokio::test]
async fn test_buffer_done_for_unknown_buffer_is_dropped() {
    let h = Harness::new(fast_config());
    let (session, mut events) = h
        .core
        .open_instance(SessionConfig::decoder(Codec::H264, 640, 480))
        .unwrap();
    session.try_state(InstanceState::StartDone).await.unwrap();

    h.hw.send_session(handle_of(&session), SessionMessage::InputBufferDone(done(99, 0)));
    session.submit_buffer(frame(1), Port::Input).await.unwrap();
    h.hw.send_session(handle_of(&session), SessionMessage::InputBufferDone(done(1, 0)));

    assert!(eventually(|| session.stats().inputs_done == 1).await);
    match next_event(&mut events).await {
        InstanceEvent::InputDone(buffer) => assert_eq!(buffer.id, 1),
        other => panic!("unexpected event {other:?}"),
    }
}

#[tokio::test]
async fn test_allocator_is_exercised_through_trait() {
    let h = Harness::new(fast_config());
    let allocator: &dyn BufferAllocator = h.allocator.as_ref();
    let region = allocator.allocate(4096, BufferKind::Persist).unwrap();
    assert_eq!(h.allocator.kind_usage(BufferKind::Persist), 4096);
    allocator.free(&region);
    assert_eq!(h.allocator.metrics().frees_total, 1);
}
