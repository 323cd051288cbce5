use dmxflow_core::{OutputConfig, FRAME_SIZE};
use dmxflow_output::{DeviceStatus, LoopbackBus, OutputPlugin, UsbDmxOutput};
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};

fn fast_config() -> OutputConfig {
    OutputConfig {
        frame_interval_ms: 2,
        settle_delay_ms: 0,
        stop_timeout_ms: 2000,
        ..Default::default()
    }
}

fn loopback_plugin(bus: &LoopbackBus) -> UsbDmxOutput {
    UsbDmxOutput::with_probes(fast_config(), vec![Arc::new(bus.clone())])
}

fn wait_for(mut cond: impl FnMut() -> bool) -> bool {
    let deadline = Instant::now() + Duration::from_secs(3);
    while Instant::now() < deadline {
        if cond() {
            return true;
        }
        thread::sleep(Duration::from_millis(1));
    }
    false
}

#[test]
fn test_zero_devices() {
    let bus = LoopbackBus::new();
    let plugin = loopback_plugin(&bus);

    assert_eq!(plugin.outputs().count(), 0);
    plugin.write_channel(0, 5, 200);
    assert_eq!(plugin.read_channel(0, 5), 0);

    let info = plugin.info_text(None);
    assert!(info.contains("Active outputs: 0"));
    assert!(info.contains("No devices found"));
}

#[test]
fn test_write_range_reaches_the_wire() {
    let bus = LoopbackBus::new();
    let path = bus.add_serial("Loopback", Some("1"));
    let mut plugin = loopback_plugin(&bus);

    plugin.open(0).unwrap();
    plugin.write_range(0, 0, &[10, 20, 30]);

    let mut expected = vec![0u8; FRAME_SIZE];
    expected[1..4].copy_from_slice(&[10, 20, 30]);
    assert!(wait_for(|| bus.last_frame(&path) == Some(expected.clone())));

    plugin.close(0).unwrap();
}

#[test]
fn test_outputs_are_repeatable() {
    let bus = LoopbackBus::with_serial_devices(2);
    bus.add_memory(Some(3));
    let plugin = loopback_plugin(&bus);

    let first: Vec<String> = plugin.outputs().collect();
    let second: Vec<String> = plugin.outputs().collect();
    assert_eq!(first.len(), 3);
    assert_eq!(first, second);
    assert_eq!(first[2], "3: Rodin2");
}

#[test]
fn test_rescan_retires_running_devices() {
    let bus = LoopbackBus::new();
    let path = bus.add_serial("Loopback", None);
    let mut plugin = loopback_plugin(&bus);

    plugin.open(0).unwrap();
    assert!(wait_for(|| bus.frame_count(&path) >= 2));

    plugin.rescan_devices();
    assert!(!bus.is_held(&path));
    let after_rescan = bus.frame_count(&path);
    thread::sleep(Duration::from_millis(30));
    assert_eq!(bus.frame_count(&path), after_rescan);

    // Same hardware, fresh device in the same slot
    assert_eq!(plugin.output_count(), 1);
    assert!(!plugin.is_open(0));
}

#[test]
fn test_rescan_picks_up_new_hardware() {
    let bus = LoopbackBus::new();
    let mut plugin = loopback_plugin(&bus);
    assert_eq!(plugin.output_count(), 0);

    bus.add_serial("Loopback", None);
    plugin.rescan_devices();
    assert_eq!(plugin.output_count(), 1);
}

#[test]
fn test_concurrent_disjoint_writers() {
    let bus = LoopbackBus::new();
    bus.add_serial("Loopback", None);
    let mut plugin = loopback_plugin(&bus);
    plugin.open(0).unwrap();

    thread::scope(|s| {
        for worker in 0..4u32 {
            let plugin = &plugin;
            s.spawn(move || {
                for round in 0..200u32 {
                    for ch in (worker * 128)..(worker * 128 + 128) {
                        plugin.write_channel(0, ch, ((ch + round) % 256) as u8);
                    }
                }
            });
        }
        s.spawn(|| {
            for _ in 0..200 {
                let frame = plugin.devices()[0].snapshot();
                assert_eq!(frame[0], 0);
                for ch in 0..512u32 {
                    let value = u32::from(frame[ch as usize + 1]);
                    let written = (0..200u32).any(|round| (ch + round) % 256 == value);
                    assert!(
                        value == 0 || written,
                        "channel {} holds {} which no writer produced",
                        ch,
                        value
                    );
                }
            }
        });
    });

    for ch in 0..512u32 {
        assert_eq!(plugin.read_channel(0, ch), ((ch + 199) % 256) as u8);
    }
}

#[test]
fn test_open_failure_then_close_is_safe() {
    let bus = LoopbackBus::new();
    let path = bus.add_serial("Loopback", None);
    let mut plugin = loopback_plugin(&bus);
    bus.unplug(&path);

    assert!(plugin.open(0).is_err());
    assert!(plugin.close(0).is_ok());
    assert!(plugin.close(0).is_ok());
    assert!(!plugin.is_open(0));
}

#[test]
fn test_hot_unplug_marks_device_lost() {
    let bus = LoopbackBus::new();
    let path = bus.add_serial("Loopback", None);
    let mut plugin = loopback_plugin(&bus);
    plugin.open(0).unwrap();

    bus.unplug(&path);
    assert!(wait_for(|| plugin.devices()[0].status() == DeviceStatus::Lost));
    assert!(plugin.info_text(None).contains("[Disconnected]"));

    // Writes keep landing in the buffer without errors
    plugin.write_channel(0, 1, 9);
    assert_eq!(plugin.read_channel(0, 1), 9);
}

#[test]
fn test_unplugged_addressable_stays_lost() {
    let bus = LoopbackBus::new();
    let path = bus.add_memory(Some(2));
    let mut plugin = loopback_plugin(&bus);

    plugin.write_channel(0, 3, 10);
    assert_eq!(bus.memory(&path)[3], 10);

    bus.unplug(&path);
    plugin.write_channel(0, 3, 11);
    assert_eq!(plugin.devices()[0].status(), DeviceStatus::Lost);

    assert!(plugin.open(0).is_err());
    assert_eq!(plugin.devices()[0].status(), DeviceStatus::Lost);
    assert!(!plugin.is_open(0));
    assert!(plugin.info_text(None).contains("[Disconnected]"));

    // Buffer keeps the value for when the hardware comes back
    assert_eq!(plugin.read_channel(0, 3), 11);
}

#[test]
fn test_pro_widget_gets_packets() {
    let bus = LoopbackBus::new();
    bus.add_serial("Loopback", None);
    let path = bus.add_serial("DMX USB PRO", Some("EN9"));
    let mut plugin = loopback_plugin(&bus);

    let names: Vec<String> = plugin.outputs().collect();
    assert_eq!(names[1], "2: DMX USB PRO (S/N: EN9)");

    plugin.open(1).unwrap();
    plugin.write_range(1, 509, &[1, 2, 3]);

    let mut expected = vec![0u8; FRAME_SIZE];
    expected[510..].copy_from_slice(&[1, 2, 3]);
    assert!(wait_for(|| bus.last_frame(&path) == Some(expected.clone())));

    plugin.close(1).unwrap();
    assert!(!bus.is_held(&path));
}

#[test]
fn test_addressable_labels() {
    let bus = LoopbackBus::new();
    bus.add_memory(Some(1));
    bus.add_memory(Some(4));
    bus.add_memory(Some(42));
    bus.add_memory(None);
    let plugin = loopback_plugin(&bus);

    let names: Vec<String> = plugin.outputs().collect();
    assert_eq!(
        names,
        vec!["1: XSwitch", "2: USBDMX21", "3: Unknown", "4: Unknown"]
    );
}

#[test]
fn test_addressable_write_through() {
    let bus = LoopbackBus::new();
    let path = bus.add_memory(Some(2));
    let mut plugin = loopback_plugin(&bus);

    plugin.open(0).unwrap();
    plugin.write_channel(0, 511, 77);
    assert_eq!(bus.memory(&path)[511], 77);
    assert_eq!(plugin.read_channel(0, 511), 77);
}
