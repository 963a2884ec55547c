use super::*;

#[test]
fn default_config_validates() {
    let cfg = RouterConfig::default();
    assert!(cfg.validate().is_ok());
}

#[test]
fn default_services_cover_the_catalog() {
    let cfg = RouterConfig::default();
    for name in [
        "whisper_asr",
        "piper_tts",
        "ollama_farm",
        "mcp_server",
        "web_scrape",
        "depth_any",
    ] {
        assert!(cfg.services.contains_key(name), "missing service {name}");
    }
}

#[test]
fn zero_workers_fails_validation() {
    let mut cfg = RouterConfig::default();
    cfg.http.workers = 0;
    assert!(cfg.validate().is_err());
}

#[test]
fn empty_whitelist_fails_validation_when_isolation_enabled() {
    let mut cfg = RouterConfig::default();
    cfg.security.port_isolation_enabled = true;
    cfg.services.get_mut("depth_any").unwrap().ports.clear();
    assert!(cfg.validate().is_err());
}

#[test]
fn empty_whitelist_is_fine_when_isolation_disabled() {
    let mut cfg = RouterConfig::default();
    cfg.security.port_isolation_enabled = false;
    cfg.services.get_mut("depth_any").unwrap().ports.clear();
    assert!(cfg.validate().is_ok());
}

#[test]
fn is_enabled_defaults_true() {
    let cfg = RouterConfig::default();
    assert!(cfg.is_enabled("ollama_farm"));
}

#[test]
fn load_missing_file_falls_back_to_defaults() {
    let cfg = RouterConfig::load(std::path::Path::new("/nonexistent/router_config.json")).unwrap();
    assert_eq!(cfg.http.workers, 4);
}

#[test]
fn round_trip_json() {
    let cfg = RouterConfig::default();
    let dir = std::env::temp_dir().join(format!("router_cfg_test_{}", std::process::id()));
    std::fs::create_dir_all(&dir).unwrap();
    let path = dir.join("router_config.json");
    cfg.save(&path).unwrap();
    let loaded = RouterConfig::load(&path).unwrap();
    assert_eq!(loaded.http.chunk_upload_b, cfg.http.chunk_upload_b);
    std::fs::remove_dir_all(&dir).ok();
}
