//! CLI command definitions and handlers.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use clap::{CommandFactory, Parser, Subcommand};
use clap_complete::Shell;
use color_eyre::eyre::{Result, eyre};

use seclabel_common::{DomainName, SeclabelPaths};

use crate::config::SecurityDriverConfig;
use crate::domain::DomainDef;
use crate::process;
use crate::security::{
    BuiltinRegistry, DAC_DRIVER_NAME, DriverRegistry, SELINUX_DRIVER_NAME, STACK_DRIVER_NAME,
    SecurityManager, selinux,
};

/// Seclabel - security labels for virtual machine domains
#[derive(Parser)]
#[command(name = "seclabel")]
#[command(author, version, about, long_about = None)]
#[command(propagate_version = true)]
pub struct Cli {
    /// Host security configuration file
    #[arg(long, global = true, env = "SECLABEL_CONFIG")]
    pub config: Option<PathBuf>,

    /// Security driver to stack, overriding the configuration (repeatable)
    #[arg(long = "driver", global = true)]
    pub drivers: Vec<String>,

    /// Enable debug logging
    #[arg(long, global = true)]
    pub debug: bool,

    /// The subcommand to execute.
    #[command(subcommand)]
    pub command: Commands,
}

/// Helper commands.
#[derive(Subcommand)]
pub enum Commands {
    /// List security drivers and whether this host supports them
    Drivers,

    /// Generate security labels for a domain definition
    ///
    /// SELinux levels held by the definitions stored under `--domains` are
    /// not handed out again.
    Generate {
        /// Domain definition (JSON, YAML or TOML)
        domain: PathBuf,

        /// Directory of already labelled domain definitions
        #[arg(long)]
        domains: Option<PathBuf>,
    },

    /// Verify the security labels of a domain definition
    Verify {
        /// Domain definition (JSON, YAML or TOML)
        domain: PathBuf,
    },

    /// Show the model and DOI of every stacked driver
    Model,

    /// Show the security label and start time of a process
    Process {
        /// Process ID
        pid: u32,

        /// Domain definition the process belongs to
        #[arg(long)]
        domain: Option<PathBuf>,
    },

    /// Generate shell completions
    Completions {
        /// Target shell
        shell: Shell,
    },
}

impl Cli {
    fn load_config(&self) -> Result<SecurityDriverConfig> {
        let path = self
            .config
            .clone()
            .unwrap_or_else(|| SeclabelPaths::new().config_file());

        let mut config = if self.config.is_some() || path.exists() {
            SecurityDriverConfig::from_file(&path)
                .map_err(|e| eyre!("Failed to load {}: {}", path.display(), e))?
        } else {
            SecurityDriverConfig::default()
        };

        if !self.drivers.is_empty() {
            config.security_driver.clone_from(&self.drivers);
        }

        Ok(config)
    }

    fn manager(&self) -> Result<Arc<SecurityManager>> {
        self.load_config()?
            .build_manager(&BuiltinRegistry::new())
            .map_err(|e| eyre!("Failed to initialize security drivers: {}", e))
    }

    /// Execute the CLI command.
    pub fn execute(self) -> Result<()> {
        match &self.command {
            Commands::Drivers => {
                let config = self.load_config()?;
                println!("NAME\tAVAILABLE");
                for driver in BuiltinRegistry::new().drivers() {
                    let available = driver.probe(&config.virt_driver);
                    println!("{}\t{}", driver.name(), if available { "yes" } else { "no" });
                }
                println!("{DAC_DRIVER_NAME}\tyes");
                println!("{STACK_DRIVER_NAME}\tyes");
                Ok(())
            }

            Commands::Generate { domain, domains } => {
                let mgr = self.manager()?;
                let mut def = load_domain(domain)?;

                let known = domains
                    .clone()
                    .unwrap_or_else(|| SeclabelPaths::new().domains());
                reserve_known_levels(&mgr, &known, &def)?;

                mgr.generate_labels(&mut def)
                    .map_err(|e| eyre!("Failed to generate labels for {}: {}", def.name, e))?;

                println!("{}", def.to_json()?);
                Ok(())
            }

            Commands::Verify { domain } => {
                let mgr = self.manager()?;
                let def = load_domain(domain)?;

                for nested in mgr.get_nested()? {
                    nested.verify(&def).map_err(|e| {
                        eyre!("Domain {} failed {} verification: {}", def.name, nested.driver_name(), e)
                    })?;
                }

                println!("Domain {} verified", def.name);
                Ok(())
            }

            Commands::Model => {
                let mgr = self.manager()?;
                println!("DRIVER\tMODEL\tDOI");
                for nested in mgr.get_nested()? {
                    println!(
                        "{}\t{}\t{}",
                        nested.driver_name(),
                        nested.get_model()?,
                        nested.get_doi()?
                    );
                }
                Ok(())
            }

            Commands::Process { pid, domain } => {
                let mgr = self.manager()?;
                let def = match domain {
                    Some(path) => load_domain(path)?,
                    None => DomainDef::new(DomainName::new("unknown")?),
                };

                let label = mgr
                    .get_process_label(&def, *pid)
                    .map_err(|e| eyre!("Failed to read label of process {}: {}", pid, e))?;
                let start = process::start_time(*pid)
                    .map_err(|e| eyre!("Failed to read start time of process {}: {}", pid, e))?;

                println!("Model:      {}", label.model);
                println!("Label:      {}", label.label);
                println!("Enforcing:  {}", label.enforcing);
                println!("Start time: {start}");
                Ok(())
            }

            Commands::Completions { shell } => {
                clap_complete::generate(
                    *shell,
                    &mut Self::command(),
                    "seclabel",
                    &mut std::io::stdout(),
                );
                Ok(())
            }
        }
    }
}

/// Reserve the SELinux levels of the domains stored in `dir`, except `current`.
fn reserve_known_levels(mgr: &Arc<SecurityManager>, dir: &Path, current: &DomainDef) -> Result<()> {
    let Some(selinux_mgr) = mgr
        .get_nested()?
        .into_iter()
        .find(|m| m.driver_name() == SELINUX_DRIVER_NAME)
    else {
        return Ok(());
    };

    let entries = match std::fs::read_dir(dir) {
        Ok(entries) => entries,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(()),
        Err(e) => return Err(eyre!("Failed to read {}: {}", dir.display(), e)),
    };

    for entry in entries {
        let path = entry?.path();
        let def = match DomainDef::from_file(&path) {
            Ok(def) => def,
            Err(e) => {
                tracing::debug!(path = %path.display(), error = %e, "Skipping domain file");
                continue;
            }
        };
        if def.uuid == current.uuid {
            continue;
        }
        if let Err(e) = selinux::reserve_domain_level(&selinux_mgr, &def) {
            tracing::warn!(domain = %def.name, error = %e, "Cannot reserve SELinux level");
        }
    }

    Ok(())
}

fn load_domain(path: &Path) -> Result<DomainDef> {
    DomainDef::from_file(path).map_err(|e| eyre!("Failed to load domain {}: {}", path.display(), e))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn verify_cli() {
        Cli::command().debug_assert();
    }

    #[test]
    fn repeated_driver_flag() {
        let cli = Cli::try_parse_from([
            "seclabel",
            "--driver",
            "selinux",
            "--driver",
            "apparmor",
            "model",
        ])
        .unwrap();
        assert_eq!(cli.drivers, ["selinux", "apparmor"]);
        assert!(matches!(cli.command, Commands::Model));
    }

    #[test]
    fn driver_flag_overrides_config() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("seclabel.toml");
        std::fs::write(&path, "security_driver = [\"selinux\"]\nuser = 107\n").unwrap();

        let cli = Cli::try_parse_from([
            "seclabel",
            "--config",
            path.to_str().unwrap(),
            "--driver",
            "none",
            "drivers",
        ])
        .unwrap();

        let config = cli.load_config().unwrap();
        assert_eq!(config.security_driver, ["none"]);
        assert_eq!(config.user, 107);
    }

    #[test]
    fn generate_skips_levels_of_stored_domains() {
        use crate::domain::{LabelType, SecurityLabelDef};
        use crate::security::SecurityManagerFlags;

        let flags = SecurityManagerFlags::default();
        let selinux_mgr = || SecurityManager::new_from_driver(selinux::driver(), "qemu", flags).unwrap();
        let dynamic = || {
            let mut def = DomainDef::new(DomainName::new("guest1").unwrap());
            def.push_seclabel(SecurityLabelDef::new(SELINUX_DRIVER_NAME, LabelType::Dynamic));
            def
        };

        let dir = tempfile::tempdir().unwrap();
        let mut stored = dynamic();
        selinux_mgr().generate_label(&mut stored).unwrap();
        std::fs::write(dir.path().join("stored.json"), stored.to_json().unwrap()).unwrap();
        std::fs::write(dir.path().join("notes.txt"), "not a domain").unwrap();

        let mgr = SecurityManager::new_stack(selinux_mgr()).unwrap();
        let mut def = dynamic();
        reserve_known_levels(&mgr, dir.path(), &def).unwrap();
        mgr.generate_labels(&mut def).unwrap();

        assert_ne!(
            def.find_seclabel(SELINUX_DRIVER_NAME).unwrap().label,
            stored.find_seclabel(SELINUX_DRIVER_NAME).unwrap().label
        );
    }

    #[test]
    fn missing_domains_dir_reserves_nothing() {
        let mgr = SecurityManager::new_stack(
            SecurityManager::new_from_driver(
                selinux::driver(),
                "qemu",
                crate::security::SecurityManagerFlags::default(),
            )
            .unwrap(),
        )
        .unwrap();
        let def = DomainDef::new(DomainName::new("guest1").unwrap());

        reserve_known_levels(&mgr, Path::new("/nonexistent/domains"), &def).unwrap();
    }

    #[test]
    fn missing_explicit_config_is_an_error() {
        let cli = Cli::try_parse_from(["seclabel", "--config", "/nonexistent/seclabel.toml", "model"])
            .unwrap();
        assert!(cli.load_config().is_err());
    }
}
