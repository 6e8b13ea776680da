//! Configuration file integration tests

use std::io::Write;

use tempfile::NamedTempFile;

use wg_forwarder::config::load_config;
use wg_forwarder::error::ConfigError;
use wg_forwarder::tunnel::{generate_private_key, EngineSettings};

fn write_config(contents: &str) -> NamedTempFile {
    let mut file = NamedTempFile::new().unwrap();
    file.write_all(contents.as_bytes()).unwrap();
    file.flush().unwrap();
    file
}

#[test]
fn test_full_config_file() {
    let private = generate_private_key();
    let peer = generate_private_key().public_key();
    let file = write_config(&format!(
        "// wg-forwarder configuration\n\
         \n\
         # tunnel\n\
         ipToIntercept = 10.0.0.2\n\
         portToIntercept=8080\n\
         wgListenPort=51820\n\
         wgPrivateKey={}\n\
         wgPublicKey={}\n\
         wgAllowedIp=10.0.0.1\n\
         \n\
         // relay\n\
         mtu=1380\n\
         persistentKeepalive=25\n\
         connectTimeoutSecs=3\n\
         idleTimeoutSecs=0\n\
         maxConnectionSecs=3600\n\
         bufferSize=16384\n\
         logLevel=debug\n\
         logFormat=json\n\
         somethingElse=ignored\n",
        private.to_base64(),
        peer.to_hex()
    ));

    let config = load_config(file.path()).unwrap();

    assert_eq!(config.tunnel.intercept_ip.to_string(), "10.0.0.2");
    assert_eq!(config.tunnel.intercept_port, 8080);
    assert_eq!(config.tunnel.listen_port, 51820);
    assert_eq!(config.tunnel.private_key, private);
    assert_eq!(config.tunnel.peer_public_key, peer);
    assert_eq!(config.tunnel.allowed_ip.to_string(), "10.0.0.1/32");

    assert_eq!(config.options.mtu, 1380);
    assert_eq!(config.options.persistent_keepalive, Some(25));
    assert_eq!(config.relay.connect_timeout_secs, 3);
    assert!(config.relay.idle_timeout().is_none());
    assert_eq!(config.relay.max_connection_secs, Some(3600));
    assert_eq!(config.relay.buffer_size, 16384);
    assert_eq!(config.log.level, "debug");
    assert_eq!(config.log.format, "json");
}

#[test]
fn test_loaded_config_renders_stable_settings() {
    let file = write_config(&format!(
        "ipToIntercept=10.0.0.2\n\
         portToIntercept=8080\n\
         wgListenPort=51820\n\
         wgPrivateKey={}\n\
         wgPublicKey={}\n\
         wgAllowedIp=10.0.0.0/24\n",
        generate_private_key().to_base64(),
        generate_private_key().public_key().to_base64()
    ));
    let config = load_config(file.path()).unwrap();

    let settings = EngineSettings::from_config(&config.tunnel, config.options.persistent_keepalive);
    let text = settings.to_string();
    assert!(text.contains("listen_port=51820\n"));
    assert!(text.contains("allowed_ip=10.0.0.0/24\n"));

    let reparsed: EngineSettings = text.parse().unwrap();
    assert_eq!(reparsed, settings);
    assert_eq!(reparsed.to_string(), text);
}

#[test]
fn test_missing_file() {
    let dir = tempfile::tempdir().unwrap();
    let result = load_config(dir.path().join("absent.conf"));
    assert!(matches!(result, Err(ConfigError::FileNotFound { .. })));
}

#[test]
fn test_line_without_equals_reports_line_number() {
    let file = write_config("// header\nipToIntercept=10.0.0.2\nnot a setting\n");
    match load_config(file.path()) {
        Err(ConfigError::MalformedLine { line, content }) => {
            assert_eq!(line, 3);
            assert_eq!(content, "not a setting");
        }
        other => panic!("expected MalformedLine, got {other:?}"),
    }
}

#[test]
fn test_missing_required_key() {
    let file = write_config(&format!(
        "ipToIntercept=10.0.0.2\n\
         portToIntercept=8080\n\
         wgPrivateKey={}\n\
         wgPublicKey={}\n\
         wgAllowedIp=10.0.0.1/32\n",
        generate_private_key().to_base64(),
        generate_private_key().public_key().to_base64()
    ));
    assert!(matches!(
        load_config(file.path()),
        Err(ConfigError::MissingKey("wgListenPort"))
    ));
}

#[test]
fn test_bad_key_material() {
    let file = write_config(
        "ipToIntercept=10.0.0.2\n\
         portToIntercept=8080\n\
         wgListenPort=51820\n\
         wgPrivateKey=tooshort\n\
         wgPublicKey=tooshort\n\
         wgAllowedIp=10.0.0.1/32\n",
    );
    assert!(matches!(
        load_config(file.path()),
        Err(ConfigError::InvalidKey { .. })
    ));
}
