#![allow(clippy::upper_case_acronyms)]

use pingora_core::apps::HttpServerOptions;
use pingora_core::listeners::tls::TlsSettings;
use pingora_core::server::configuration::Opt;
use pingora_core::server::Server;
use pingora_proxy::http_proxy_service_with_name;

use embercache::config::{Config, Tls};
use embercache::logging::Logger;
use embercache::service::http::build_http_service;

fn main() {
    // Read command-line arguments
    let opt = Opt::parse_args();

    // Load configuration with optional override
    let config = Config::load_yaml_with_opt_override(&opt).expect("Failed to load configuration");

    // Initialize logging: a file-backed async logger if configured, otherwise env_logger's
    // default stderr target.
    let logger = if let Some(log_cfg) = &config.server.log {
        let logger = Logger::new(log_cfg.clone());
        logger.init_env_logger();
        Some(logger)
    } else {
        env_logger::init();
        None
    };

    // Load routes from configuration
    log::info!("Loading routes...");
    let http_service = build_http_service(&config).expect("Failed to initialize proxy service");

    // Create Pingora server with optional configuration
    let mut proxy_server = Server::new_with_opt_and_conf(Some(opt), config.pingora);

    // Create HTTP proxy service with name
    let mut http_service =
        http_proxy_service_with_name(&proxy_server.configuration, http_service, "embercache");

    // Add listeners from configuration
    log::info!("Adding listeners...");
    for list_cfg in config.server.listeners {
        match list_cfg.tls {
            Some(Tls {
                cert_path,
                key_path,
            }) => {
                let mut settings = TlsSettings::intermediate(&cert_path, &key_path)
                    .expect("Adding TLS listener shouldn't fail");
                if list_cfg.offer_h2 {
                    settings.enable_h2();
                }
                http_service.add_tls_with_settings(&list_cfg.address.to_string(), None, settings);
            }
            None => {
                if list_cfg.offer_h2c {
                    let http_logic = http_service.app_logic_mut().unwrap();
                    let mut http_server_options = HttpServerOptions::default();
                    http_server_options.h2c = true;
                    http_logic.server_options = Some(http_server_options);
                }
                http_service.add_tcp(&list_cfg.address.to_string());
            }
        }
    }

    // Bootstrapping and server startup
    log::info!("Bootstrapping...");
    proxy_server.bootstrap();

    log::info!("Bootstrapped. Adding Services...");
    if let Some(log_service) = logger {
        proxy_server.add_service(log_service);
    }
    proxy_server.add_service(http_service);

    log::info!("Starting Server...");
    proxy_server.run_forever();
}
