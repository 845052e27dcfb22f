//! Integration tests for configuration parsing
//!
//! Covers the documented boardctl config layout:
//! - Minimal and full configuration files
//! - Filter patterns
//! - Writing and re-reading a config file

mod boardctl_config {
    const MINIMAL_CONFIG: &str = r#"
[general]
log_level = "info"
"#;

    const FULL_CONFIG: &str = r#"
[general]
log_level = "debug"

[manager]
drop_delay_ms = 2500

[pool]
max_threads = 4
idle_timeout_ms = 0

[usb]
filters = ["0x16c0:*", "0x2341:0x0043"]

[upload]
reset_after = false
reboot_delay_ms = 8000
"#;

    #[test]
    fn test_parse_minimal_config() {
        let config: toml::Value = toml::from_str(MINIMAL_CONFIG).unwrap();

        let general = config.get("general").unwrap();
        assert_eq!(general.get("log_level").unwrap().as_str().unwrap(), "info");

        assert!(config.get("manager").is_none());
        assert!(config.get("usb").is_none());
    }

    #[test]
    fn test_parse_full_config() {
        let config: toml::Value = toml::from_str(FULL_CONFIG).unwrap();

        let general = config.get("general").unwrap();
        assert_eq!(general.get("log_level").unwrap().as_str().unwrap(), "debug");

        let manager = config.get("manager").unwrap();
        assert_eq!(
            manager.get("drop_delay_ms").unwrap().as_integer().unwrap(),
            2500
        );

        let pool = config.get("pool").unwrap();
        assert_eq!(pool.get("max_threads").unwrap().as_integer().unwrap(), 4);
        assert_eq!(pool.get("idle_timeout_ms").unwrap().as_integer().unwrap(), 0);

        let usb = config.get("usb").unwrap();
        let filters = usb.get("filters").unwrap().as_array().unwrap();
        assert_eq!(filters.len(), 2);
        assert_eq!(filters[0].as_str().unwrap(), "0x16c0:*");

        let upload = config.get("upload").unwrap();
        assert!(!upload.get("reset_after").unwrap().as_bool().unwrap());
        assert_eq!(
            upload.get("reboot_delay_ms").unwrap().as_integer().unwrap(),
            8000
        );
    }

    #[test]
    fn test_filters_have_vid_pid_shape() {
        let config: toml::Value = toml::from_str(FULL_CONFIG).unwrap();
        let filters = config["usb"]["filters"].as_array().unwrap();

        for filter in filters {
            let filter = filter.as_str().unwrap();
            let (vid, pid) = filter.split_once(':').unwrap();
            for part in [vid, pid] {
                assert!(part == "*" || part.starts_with("0x"), "bad part in {}", filter);
            }
        }
    }

    #[test]
    fn test_invalid_toml_is_rejected() {
        let result: Result<toml::Value, _> = toml::from_str("[pool\nmax_threads = 4");
        assert!(result.is_err());
    }
}

mod config_file {
    use std::fs;

    #[test]
    fn test_write_and_reread() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("boardctl").join("config.toml");
        fs::create_dir_all(path.parent().unwrap()).unwrap();

        let mut table = toml::map::Map::new();
        let mut manager = toml::map::Map::new();
        manager.insert("drop_delay_ms".to_string(), toml::Value::Integer(750));
        table.insert("manager".to_string(), toml::Value::Table(manager));

        fs::write(&path, toml::to_string_pretty(&toml::Value::Table(table)).unwrap()).unwrap();

        let content = fs::read_to_string(&path).unwrap();
        let config: toml::Value = toml::from_str(&content).unwrap();
        assert_eq!(
            config["manager"]["drop_delay_ms"].as_integer().unwrap(),
            750
        );
    }
}
