// Decode -> buffer -> render, the way a viewer drives the crate

use neuroscope_client::{
    ChannelRingBuffer, ClientConfig, DecimationStrategy, IngestLoop, RenderPath, SampleFrame,
    TraceLayout,
};
use parking_lot::RwLock;
use std::sync::Arc;
use std::time::Instant;

fn sine(len: usize, phase: f32) -> Vec<f32> {
    (0..len).map(|i| (i as f32 * 0.05 + phase).sin() * 100.0).collect()
}

#[test]
fn frames_flow_into_render_path() {
    let config = ClientConfig {
        channel_count: 4,
        samples_per_channel: 4096,
        ..Default::default()
    };
    config.validate().unwrap();

    let buffer = Arc::new(RwLock::new(
        ChannelRingBuffer::new(config.channel_count, config.samples_per_channel).unwrap(),
    ));
    let mut ingest = IngestLoop::new("ws://127.0.0.1:1/ws/neural-data", buffer.clone(), &config);

    // 8 frames of 512 samples fill the ring exactly
    for frame in 0..8 {
        let channels: Vec<Vec<f32>> = (0..4).map(|c| sine(512, (frame * 4 + c) as f32)).collect();
        ingest.handle_binary(&SampleFrame::encode(&channels).unwrap());
    }

    let stats = ingest.stats().snapshot();
    assert_eq!(stats.binary_frames, 8);
    assert_eq!(stats.samples_pushed, 8 * 4 * 512);
    assert_eq!(buffer.read().fill_level(3), 1.0);

    let mut render = RenderPath::from_config(&config);
    let guard = buffer.read();

    let zoomed_out = render.render(&guard, 0, 4096, 800);
    assert!(matches!(zoomed_out.strategy, TraceLayout::CachedLevel { factor: 4 }));
    let (lo, hi) = zoomed_out
        .points
        .iter()
        .fold((f32::MAX, f32::MIN), |(lo, hi), &v| (lo.min(v), hi.max(v)));
    assert!(lo >= -100.0 && hi <= 100.0);
    assert!(hi - lo > 150.0);

    let zoomed_in = render.render(&guard, 0, 600, 800);
    assert_eq!(
        zoomed_in.strategy,
        TraceLayout::Direct(DecimationStrategy::PassThrough)
    );
    assert_eq!(zoomed_in.points.len(), 600);
}

#[test]
fn json_samples_and_malformed_frames_coexist() {
    let config = ClientConfig {
        channel_count: 2,
        samples_per_channel: 16,
        ..Default::default()
    };
    let buffer = Arc::new(RwLock::new(ChannelRingBuffer::new(2, 16).unwrap()));
    let mut ingest = IngestLoop::new("ws://127.0.0.1:1/ws/neural-data", buffer.clone(), &config);

    ingest.handle_text(
        r#"{"type":"samples","seq":7,"channels":[[1.5,2.5],[3.5,4.5]]}"#,
        Instant::now(),
    );
    ingest.handle_binary(&[0xff; 12]);
    ingest.handle_text(
        r#"[{"type":"samples","seq":9,"channels":[[5.5],[6.5]]}]"#,
        Instant::now(),
    );

    let stats = ingest.stats().snapshot();
    assert_eq!(stats.decode_errors, 1);
    assert_eq!(stats.sequence_gaps, 1);
    assert_eq!(buffer.read().latest(0, 3), vec![1.5, 2.5, 5.5]);
    assert_eq!(buffer.read().latest(1, 3), vec![3.5, 4.5, 6.5]);
}
