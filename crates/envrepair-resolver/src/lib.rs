mod adopt;
mod conflicts;
mod index;

pub use adopt::{
    adoption_candidates, plan_adoption, plan_pip_uninstall, AdoptionPlan, PipUninstallPlan,
    SkippedUninstall,
};
pub use conflicts::{find_cross_channel_conflicts, CrossChannelConflicts};
pub use index::{choose_installer, ChannelIndex, Installer, InstallerChoice, InstallerPreference};
