//! Integration tests for board operations
//!
//! Covers the checks `Board::upload` runs before flashing, capability
//! routing of reset/reboot/serial, identity matching and caller data.

use board::model::{TEENSY_20, TEENSY_30};
use board::test_utils::{
    BOOTLOADER_PID, MockBackend, MockProfile, OpsLog, SERIAL_PID, TEENSY_VID, VirtualBus,
    firmware_for,
};
use board::{
    Board, BoardManager, Capabilities, Firmware, Identity, ManagerConfig, SerialFlags,
    UploadFlags, VendorBackend,
};
use common::Error;
use std::sync::Arc;

fn board_in_mode(backend: MockBackend, pid: u16) -> (VirtualBus, BoardManager, Board, OpsLog) {
    let log = backend.log();
    let bus = VirtualBus::new();
    let backends: Vec<Arc<dyn VendorBackend>> = vec![Arc::new(backend)];
    let manager = BoardManager::new(bus.monitor(), backends, ManagerConfig::default());

    bus.plug("usb-2-1", TEENSY_VID, pid, Some("4242"));
    manager.refresh().unwrap();
    let board = manager.boards().remove(0);

    (bus, manager, board, log)
}

fn bootloader() -> (VirtualBus, BoardManager, Board, OpsLog) {
    board_in_mode(MockBackend::teensy(), BOOTLOADER_PID)
}

mod upload {
    use super::*;

    #[test]
    fn test_upload_matching_firmware() {
        let (_bus, _manager, board, log) = bootloader();
        let firmware = firmware_for(&TEENSY_30, 4000);
        let mut last = (0, 0);

        board
            .upload(&firmware, UploadFlags::empty(), |done, total| last = (done, total))
            .unwrap();

        assert_eq!(last, (4000, 4000));
        assert_eq!(*log.lock(), vec!["upload teensy30.bin 4000".to_string()]);
    }

    #[test]
    fn test_upload_rejects_oversized_image() {
        let (_bus, _manager, board, log) = bootloader();
        let firmware = firmware_for(&TEENSY_30, TEENSY_30.code_size + 1);

        let err = board
            .upload(&firmware, UploadFlags::NO_CHECK, |_, _| {})
            .unwrap_err();

        match err {
            Error::FirmwareTooLarge { size, max, .. } => {
                assert_eq!(size, TEENSY_30.code_size + 1);
                assert_eq!(max, TEENSY_30.code_size);
            }
            other => panic!("unexpected error: {other}"),
        }
        assert!(log.lock().is_empty());
    }

    #[test]
    fn test_upload_rejects_firmware_for_other_model() {
        let (_bus, _manager, board, _log) = bootloader();
        let firmware = firmware_for(&TEENSY_20, 1000);

        let err = board
            .upload(&firmware, UploadFlags::empty(), |_, _| {})
            .unwrap_err();

        assert!(err.to_string().contains("compiled for Teensy 2.0"));
    }

    #[test]
    fn test_upload_rejects_unknown_firmware() {
        let (_bus, _manager, board, _log) = bootloader();
        let firmware = Firmware::from_bytes("blank.bin", vec![0u8; 512]);

        let err = board
            .upload(&firmware, UploadFlags::empty(), |_, _| {})
            .unwrap_err();

        assert!(matches!(err, Error::Firmware(_)));
        assert!(err.to_string().contains("not compiled for a known device"));
    }

    #[test]
    fn test_no_check_skips_signature() {
        let (_bus, _manager, board, log) = bootloader();
        let firmware = Firmware::from_bytes("blank.bin", vec![0u8; 512]);

        board
            .upload(&firmware, UploadFlags::NO_CHECK, |_, _| {})
            .unwrap();

        assert_eq!(log.lock().len(), 1);
    }

    #[test]
    fn test_upload_unavailable_in_serial_mode() {
        let (_bus, _manager, board, _log) = board_in_mode(MockBackend::teensy(), SERIAL_PID);
        let firmware = firmware_for(&TEENSY_30, 1000);

        let err = board
            .upload(&firmware, UploadFlags::empty(), |_, _| {})
            .unwrap_err();

        assert!(matches!(err, Error::Mode(_)));
    }

    #[test]
    fn test_upload_requires_known_model() {
        let backend = MockBackend::new().with_profile(MockProfile {
            vid: TEENSY_VID,
            pid: BOOTLOADER_PID,
            capabilities: Capabilities::UPLOAD,
            model: None,
            desc: "Unknown Bootloader",
        });
        let (_bus, _manager, board, _log) = board_in_mode(backend, BOOTLOADER_PID);
        let firmware = firmware_for(&TEENSY_30, 1000);

        let err = board
            .upload(&firmware, UploadFlags::NO_CHECK, |_, _| {})
            .unwrap_err();

        assert!(matches!(err, Error::Mode(_)));
        assert!(err.to_string().contains("unknown board model"));
    }
}

mod operations {
    use super::*;

    #[test]
    fn test_reset_in_bootloader() {
        let (_bus, _manager, board, log) = bootloader();
        board.reset().unwrap();
        assert_eq!(*log.lock(), vec!["reset".to_string()]);
    }

    #[test]
    fn test_reboot_needs_firmware_mode() {
        let (_bus, _manager, board, _log) = bootloader();
        assert!(matches!(board.reboot(), Err(Error::Mode(_))));

        let (_bus, _manager, board, log) = board_in_mode(MockBackend::teensy(), SERIAL_PID);
        board.reboot().unwrap();
        assert_eq!(*log.lock(), vec!["reboot".to_string()]);
    }

    #[test]
    fn test_serial_loopback() {
        let (_bus, _manager, board, log) = board_in_mode(MockBackend::teensy(), SERIAL_PID);
        board
            .serial_set_attributes(115200, SerialFlags::empty())
            .unwrap();

        assert_eq!(board.serial_write(b"ping").unwrap(), 4);
        let mut buf = [0u8; 16];
        let n = board.serial_read(&mut buf, None).unwrap();

        assert_eq!(&buf[..n], b"ping");
        assert_eq!(*log.lock(), vec!["serial 115200".to_string()]);
    }

    #[test]
    fn test_serial_unavailable_in_bootloader() {
        let (_bus, _manager, board, _log) = bootloader();
        assert!(matches!(board.serial_write(b"x"), Err(Error::Mode(_))));
    }
}

mod identity {
    use super::*;

    #[test]
    fn test_matches_identity() {
        let (_bus, _manager, board, _log) = bootloader();

        assert!(board.matches_identity("").unwrap());
        assert!(board.matches_identity("usb-2-1").unwrap());
        assert!(board.matches_identity("usb-2-1#4242").unwrap());
        assert!(board.matches_identity("#4242").unwrap());
        assert!(!board.matches_identity("#42").unwrap());
        assert!(!board.matches_identity("usb-2-2").unwrap());
        assert!(matches!(board.matches_identity("#abc"), Err(Error::Param(_))));
    }

    #[test]
    fn test_find_by_identity() {
        let (_bus, manager, board, _log) = bootloader();

        let found = manager.find(&"#4242".parse::<Identity>().unwrap());
        assert_eq!(found, Some(board));
        assert!(manager.find(&"#1".parse::<Identity>().unwrap()).is_none());
    }

    #[test]
    fn test_lock_is_reentrant() {
        let (_bus, _manager, board, _log) = bootloader();

        let _guard = board.lock();
        assert_eq!(board.serial_number(), 4242);
        assert_eq!(board.location(), "usb-2-1");
    }

    #[test]
    fn test_udata() {
        let (_bus, _manager, board, _log) = bootloader();
        assert!(board.udata().is_none());

        board.set_udata(Some(Arc::new(7u32)));
        assert_eq!(board.udata_as::<u32>().as_deref(), Some(&7));
        assert!(board.udata_as::<String>().is_none());

        board.set_udata(None);
        assert!(board.udata().is_none());
    }
}
