use dmxflow_core::{ChannelBuffer, CHANNELS_PER_UNIVERSE};
use proptest::prelude::*;

proptest! {
    #[test]
    fn write_then_read_returns_value(channel in 0u16..512, value in any::<u8>()) {
        let mut buffer = ChannelBuffer::new();
        buffer.write(channel, value);
        prop_assert_eq!(buffer.read(channel), value);
    }

    #[test]
    fn write_range_then_read_range_matches(
        (address, values) in (0usize..=CHANNELS_PER_UNIVERSE).prop_flat_map(|a| {
            (Just(a), proptest::collection::vec(any::<u8>(), 0..=CHANNELS_PER_UNIVERSE - a))
        })
    ) {
        let mut buffer = ChannelBuffer::new();
        buffer.write_range(address as u16, &values);

        let mut out = vec![0u8; values.len()];
        buffer.read_range(address as u16, &mut out);
        prop_assert_eq!(out, values);
    }

    #[test]
    fn write_leaves_other_channels_untouched(channel in 0u16..512, value in 1u8..=255) {
        let mut buffer = ChannelBuffer::new();
        buffer.write(channel, value);

        let touched = buffer
            .channels()
            .iter()
            .enumerate()
            .filter(|&(_, &v)| v != 0)
            .map(|(i, _)| i)
            .collect::<Vec<_>>();
        prop_assert_eq!(touched, vec![channel as usize]);
        prop_assert_eq!(buffer.start_code(), 0);
    }
}

#[test]
fn test_frame_layout() {
    let mut buffer = ChannelBuffer::new();
    buffer.write_range(0, &[10, 20, 30]);

    let frame = buffer.snapshot();
    assert_eq!(frame[0], 0);
    assert_eq!(&frame[1..4], &[10, 20, 30]);
    assert!(frame[4..].iter().all(|&v| v == 0));
}

#[test]
fn test_dirty_cycle() {
    let mut buffer = ChannelBuffer::new();
    assert!(buffer.take_dirty());
    assert!(!buffer.take_dirty());

    buffer.write(100, 1);
    assert!(buffer.take_dirty());

    buffer.set_start_code(0x17);
    assert!(buffer.is_dirty());
}
