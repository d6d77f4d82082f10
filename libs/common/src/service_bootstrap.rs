//! Service bootstrap utilities
//!
//! Startup banner and service metadata shared by heatsrv binaries.

use tracing::info;

/// Service metadata for startup
#[derive(Debug, Clone)]
pub struct ServiceInfo {
    /// Service name (e.g., "heatsrv")
    pub name: String,
    /// Service version
    pub version: String,
    /// Service description
    pub description: String,
}

impl ServiceInfo {
    /// Create new service info
    pub fn new(
        name: impl Into<String>,
        version: impl Into<String>,
        description: impl Into<String>,
    ) -> Self {
        Self {
            name: name.into(),
            version: version.into(),
            description: description.into(),
        }
    }
}

/// Print the startup banner
pub fn print_startup_banner(service: &ServiceInfo) {
    let banner = match service.name.as_str() {
        "heatsrv" => {
            r#"
 ██╗  ██╗███████╗ █████╗ ████████╗███████╗██████╗ ██╗   ██╗
 ██║  ██║██╔════╝██╔══██╗╚══██╔══╝██╔════╝██╔══██╗██║   ██║
 ███████║█████╗  ███████║   ██║   ███████╗██████╔╝██║   ██║
 ██╔══██║██╔══╝  ██╔══██║   ██║   ╚════██║██╔══██╗╚██╗ ██╔╝
 ██║  ██║███████╗██║  ██║   ██║   ███████║██║  ██║ ╚████╔╝
 ╚═╝  ╚═╝╚══════╝╚═╝  ╚═╝   ╚═╝   ╚══════╝╚═╝  ╚═╝  ╚═══╝
            "#
        },
        _ => "",
    };

    if !banner.is_empty() {
        info!("{}", banner);
    }
    info!(" {} v{}", service.name.to_uppercase(), service.version);
    info!(" {}", service.description);
    info!("");
}
