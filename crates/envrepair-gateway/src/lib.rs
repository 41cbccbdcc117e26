mod command;
mod discovery;
mod manager;
mod parse;
mod pip;
mod process;

pub use command::CommandSpec;
pub use discovery::{
    interpreter_path, is_managed_environment, resolve_targets, DetectedManagers,
    EnvironmentInventory,
};
pub use manager::{CleanScope, EnvTarget, InstallOptions, ManagerInfo, ManagerKind, PackageManager};
pub use parse::{
    parse_channels, parse_inconsistent, parse_info, parse_list_entries, parse_pip_list,
    parse_revisions, parse_search_names, parse_site_packages, InconsistencyReport,
};
pub use pip::{PipGateway, OPENSSL_VERSION_SCRIPT};
pub use process::{
    install_interrupt_handler, CancelToken, CommandOutput, CommandRunner, GatewayError,
    LiveOutput, SystemRunner,
};
