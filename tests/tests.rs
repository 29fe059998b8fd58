use ci_launcher::config::loader::{load_config, save_config};
use ci_launcher::config::{Config, ConsoleSettings, shared, update_config};

fn create_test_runtime() -> tokio::runtime::Runtime {
    tokio::runtime::Runtime::new().unwrap()
}

mod config_validation {
    use super::*;

    #[test]
    fn valid_default_config() {
        assert!(Config::default().validate().is_ok());
    }

    #[test]
    fn invalid_config_version() {
        let config = Config {
            version: 999,
            ..Config::default()
        };

        let result = config.validate();
        assert!(result.is_err());
        assert!(
            result
                .unwrap_err()
                .to_string()
                .contains("Unsupported config version")
        );
    }

    #[test]
    fn invalid_ci_url() {
        let mut config = Config::default();
        config.ci.url = "not a url".to_string();
        assert!(config.validate().is_err());
    }

    #[test]
    fn zero_tunnel_port() {
        let mut config = Config::default();
        config.ci.tunnel.ssh.port = 0;
        assert!(config.validate().is_err());
    }

    #[test]
    fn connection_requires_http_url() {
        let mut config = Config::default();
        assert!(!config.ci.has_connection());

        config.ci.url = "ftp://jenkins".to_string();
        assert!(!config.ci.has_connection());

        config.ci.url = "HTTPS://jenkins".to_string();
        assert!(config.ci.has_connection());
    }
}

mod config_persistence {
    use super::*;

    #[test]
    fn missing_file_is_created_with_defaults() {
        let runtime = create_test_runtime();
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("launcher.yaml");

        let config = runtime.block_on(load_config(&path)).unwrap();

        assert!(path.exists());
        assert_eq!(config.run_mode, "client");
        assert_eq!(config.ci.tunnel.ssh.port, 22);
    }

    #[test]
    fn saved_values_survive_reload() {
        let runtime = create_test_runtime();
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("launcher.yaml");

        let mut config = Config::default();
        config.ci.url = "https://ci.example.com".to_string();
        config.client.name = "build01".to_string();
        config.ci.tunnel.ssh.enabled = true;
        config.ci.tunnel.ssh.fingerprint = "-".to_string();
        config
            .runtime
            .java_args
            .push("-XX:OnOutOfMemoryError=x".to_string());

        runtime.block_on(save_config(&path, &config)).unwrap();
        let reloaded = runtime.block_on(load_config(&path)).unwrap();

        assert_eq!(reloaded.ci.url, "https://ci.example.com");
        assert_eq!(reloaded.client.name, "build01");
        assert!(reloaded.ci.tunnel.ssh.enabled);
        assert_eq!(reloaded.ci.tunnel.ssh.fingerprint, "-");
        assert!(reloaded.runtime.java_args.is_empty());
    }

    #[test]
    fn corrupted_file_is_backed_up() {
        let runtime = create_test_runtime();
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("launcher.yaml");
        std::fs::write(&path, "ci: [not: valid").unwrap();

        let result = runtime.block_on(load_config(&path));

        assert!(result.is_err());
        assert!(dir.path().join("launcher.yaml.bak").exists());
        let replaced = runtime.block_on(load_config(&path)).unwrap();
        assert_eq!(replaced.run_mode, "client");
    }
}

mod shared_config {
    use super::*;
    use std::sync::Arc;

    #[test]
    fn concurrent_updates_are_not_lost() {
        let config = shared(Config::default());

        let handles: Vec<_> = (0..8)
            .map(|i| {
                let config = Arc::clone(&config);
                std::thread::spawn(move || {
                    for j in 0..25 {
                        update_config(&config, |c| {
                            c.runtime
                                .connect_args
                                .insert(format!("-arg{}-{}", i, j), "x".to_string());
                        });
                    }
                })
            })
            .collect();

        for handle in handles {
            handle.join().unwrap();
        }

        assert_eq!(config.load().runtime.connect_args.len(), 200);
    }
}

mod console_tokens {
    use super::*;

    #[test]
    fn default_tokens_trigger_restart() {
        let console = ConsoleSettings::default();
        for token in &console.restart_tokens {
            assert!(console.is_restart_triggered(&format!("SEVERE: {} happened", token)));
        }
        assert!(!console.is_restart_triggered("INFO: Connected"));
    }

    #[test]
    fn empty_tokens_never_match() {
        let console = ConsoleSettings {
            restart_tokens: vec![String::new()],
        };
        assert!(!console.is_restart_triggered("anything"));
    }
}
