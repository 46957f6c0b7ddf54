//! Host-local nftables sink.
//!
//! Asserts a named IPv4 interval set inside a named table, referenced by a
//! drop rule in a named chain. All mutations go through the `nft` binary;
//! the subsystem's "Object exists" / "No such file or directory" stderr
//! markers are the idempotency signals, so re-asserting existing state is
//! never an error.

use std::path::Path;
use std::sync::Arc;

use tracing::{debug, info};

use crate::cmd::{args_to_strings, CommandExecutor, CommandOutput};
use crate::config::LocalConfig;
use crate::decision::validate_ipv4_or_cidr;
use crate::error::WardenError;

const IDEMPOTENT_MARKERS: &[&str] = &["Object exists", "No such file or directory"];

/// Resolve the nft binary; sbin is not on PATH for every service manager.
fn nft_path() -> &'static str {
    for candidate in ["/usr/sbin/nft", "/sbin/nft"] {
        if Path::new(candidate).exists() {
            return candidate;
        }
    }
    "nft"
}

pub struct LocalSink {
    executor: Arc<dyn CommandExecutor>,
    table: String,
    chain: String,
    set: String,
}

impl LocalSink {
    /// Build the sink and assert the table/set/rule scaffolding exists.
    pub fn new(executor: Arc<dyn CommandExecutor>, config: &LocalConfig) -> Result<Self, WardenError> {
        let sink = Self::from_parts(executor, config);
        sink.init()?;
        Ok(sink)
    }

    /// Construction without the init probe; callers own the scaffolding.
    pub(crate) fn from_parts(executor: Arc<dyn CommandExecutor>, config: &LocalConfig) -> Self {
        Self {
            executor,
            table: config.table.clone(),
            chain: config.chain.clone(),
            set: config.set.clone(),
        }
    }

    fn run(&self, args: &[&str]) -> Result<CommandOutput, WardenError> {
        self.executor
            .execute(nft_path(), &args_to_strings(args))
            .map_err(|e| WardenError::Subsystem(format!("failed to run nft: {}", e)))
    }

    /// Run an nft mutation, treating the subsystem's idempotency markers as
    /// success.
    fn run_coalesced(&self, args: &[&str]) -> Result<(), WardenError> {
        let output = self.run(args)?;
        if output.success {
            return Ok(());
        }
        if IDEMPOTENT_MARKERS.iter().any(|m| output.stderr.contains(m)) {
            debug!("nft {:?}: already in desired state", args.first());
            return Ok(());
        }
        Err(WardenError::Subsystem(format!(
            "nft {} failed: {}",
            args.join(" "),
            output.stderr.trim()
        )))
    }

    /// Create-if-missing for the table, the interval set, and the drop rule.
    fn init(&self) -> Result<(), WardenError> {
        let probe = self.run(&["list", "set", "ip", &self.table, &self.set])?;
        if !probe.success {
            info!(
                "Creating nftables table {} set {} chain {}",
                self.table, self.chain, self.set
            );
            self.run_coalesced(&["add", "table", "ip", &self.table])?;
            self.run_coalesced(&[
                "add", "set", "ip", &self.table, &self.set, "{", "type", "ipv4_addr", ";",
                "flags", "interval", ";", "}",
            ])?;
        }

        self.run_coalesced(&[
            "add", "chain", "ip", &self.table, &self.chain, "{", "type", "filter", "hook",
            "input", "priority", "0", ";", "policy", "accept", ";", "}",
        ])?;

        let saddr_ref = format!("@{}", self.set);
        let chain_listing = self.run(&["list", "chain", "ip", &self.table, &self.chain])?;
        if !(chain_listing.success && chain_listing.stdout.contains(&saddr_ref)) {
            self.run_coalesced(&[
                "add", "rule", "ip", &self.table, &self.chain, "ip", "saddr", &saddr_ref, "drop",
            ])?;
            info!("Installed drop rule for set {} in chain {}", self.set, self.chain);
        }

        Ok(())
    }

    /// Insert one address; already-present coalesces to success.
    pub fn add(&self, ip: &str) -> Result<(), WardenError> {
        validate_ipv4_or_cidr(ip)?;
        self.run_coalesced(&[
            "add", "element", "ip", &self.table, &self.set, "{", ip, "}",
        ])
    }

    /// Delete one address; not-found coalesces to success.
    pub fn remove(&self, ip: &str) -> Result<(), WardenError> {
        validate_ipv4_or_cidr(ip)?;
        self.run_coalesced(&[
            "delete", "element", "ip", &self.table, &self.set, "{", ip, "}",
        ])
    }

    /// Current membership as textual addresses.
    pub fn list(&self) -> Result<Vec<String>, WardenError> {
        let output = self.run(&["list", "set", "ip", &self.table, &self.set])?;
        if !output.success {
            return Err(WardenError::Subsystem(format!(
                "nft list set failed: {}",
                output.stderr.trim()
            )));
        }
        Ok(parse_set_elements(&output.stdout))
    }

    /// Drop every member; administrative reset.
    pub fn flush(&self) -> Result<(), WardenError> {
        self.run_coalesced(&["flush", "set", "ip", &self.table, &self.set])
    }
}

/// Check for effective UID 0. Mutating nftables state needs CAP_NET_ADMIN;
/// the UID check covers the common sudo/systemd case.
pub fn check_root() -> Result<(), WardenError> {
    // SAFETY: geteuid() reads the effective user ID, has no preconditions,
    // and cannot fail.
    let euid = unsafe { libc::geteuid() };
    if euid != 0 {
        return Err(WardenError::Configuration(
            "the local nftables plane requires root privileges (or CAP_NET_ADMIN)".to_string(),
        ));
    }
    Ok(())
}

/// Pull the members out of `nft list set` output. The elements block may
/// wrap across lines for large sets.
fn parse_set_elements(output: &str) -> Vec<String> {
    let Some(start) = output.find("elements") else {
        return Vec::new();
    };
    let rest = &output[start..];
    let Some(open) = rest.find('{') else {
        return Vec::new();
    };
    let Some(close) = rest.find('}') else {
        return Vec::new();
    };

    rest[open + 1..close]
        .split(',')
        .map(|entry| entry.trim().to_string())
        .filter(|entry| !entry.is_empty())
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cmd::MockCommandExecutor;

    fn config() -> LocalConfig {
        LocalConfig {
            table: "ghostwarden".to_string(),
            chain: "input".to_string(),
            set: "banned".to_string(),
        }
    }

    fn sink(mock: MockCommandExecutor) -> LocalSink {
        LocalSink::from_parts(Arc::new(mock), &config())
    }

    #[test]
    fn test_parse_set_elements_single_line() {
        let output = r#"table ip ghostwarden {
	set banned {
		type ipv4_addr
		flags interval
		elements = { 203.0.113.5, 198.51.100.0/24 }
	}
}"#;
        let members = parse_set_elements(output);
        assert_eq!(members, vec!["203.0.113.5", "198.51.100.0/24"]);
    }

    #[test]
    fn test_parse_set_elements_wrapped_lines() {
        let output = "set banned {\n\telements = { 1.2.3.4, 5.6.7.8,\n\t\t     9.9.9.9 }\n}";
        let members = parse_set_elements(output);
        assert_eq!(members, vec!["1.2.3.4", "5.6.7.8", "9.9.9.9"]);
    }

    #[test]
    fn test_parse_set_elements_empty_set() {
        let output = "table ip ghostwarden {\n\tset banned {\n\t\ttype ipv4_addr\n\t}\n}";
        assert!(parse_set_elements(output).is_empty());
    }

    #[test]
    fn test_add_issues_element_insert() {
        let mut mock = MockCommandExecutor::new();
        mock.expect_execute()
            .withf(|_, args| {
                args[..5] == ["add", "element", "ip", "ghostwarden", "banned"]
                    && args.contains(&"203.0.113.5".to_string())
            })
            .times(1)
            .returning(|_, _| Ok(CommandOutput::ok("")));

        sink(mock).add("203.0.113.5").unwrap();
    }

    #[test]
    fn test_add_coalesces_existing_element() {
        let mut mock = MockCommandExecutor::new();
        mock.expect_execute()
            .times(1)
            .returning(|_, _| Ok(CommandOutput::fail("Error: Object exists\n")));

        assert!(sink(mock).add("203.0.113.5").is_ok());
    }

    #[test]
    fn test_remove_coalesces_absent_element() {
        let mut mock = MockCommandExecutor::new();
        mock.expect_execute()
            .withf(|_, args| args[0] == "delete")
            .times(1)
            .returning(|_, _| {
                Ok(CommandOutput::fail(
                    "Error: No such file or directory; did you mean set ...\n",
                ))
            });

        assert!(sink(mock).remove("203.0.113.5").is_ok());
    }

    #[test]
    fn test_add_surfaces_real_subsystem_error() {
        let mut mock = MockCommandExecutor::new();
        mock.expect_execute()
            .times(1)
            .returning(|_, _| Ok(CommandOutput::fail("Error: Could not process rule\n")));

        assert!(matches!(
            sink(mock).add("203.0.113.5"),
            Err(WardenError::Subsystem(_))
        ));
    }

    #[test]
    fn test_add_rejects_invalid_input_before_subprocess() {
        // No expectations: any execute call would panic the mock.
        let mock = MockCommandExecutor::new();
        let result = sink(mock).add("1.2.3.4; flush ruleset");
        assert!(matches!(result, Err(WardenError::InvalidInput(_))));
    }

    #[test]
    fn test_list_parses_membership() {
        let mut mock = MockCommandExecutor::new();
        mock.expect_execute()
            .withf(|_, args| args[0] == "list" && args[1] == "set")
            .times(1)
            .returning(|_, _| {
                Ok(CommandOutput::ok(
                    "table ip ghostwarden {\n\tset banned {\n\t\telements = { 203.0.113.5 }\n\t}\n}",
                ))
            });

        let members = sink(mock).list().unwrap();
        assert_eq!(members, vec!["203.0.113.5"]);
    }

    #[test]
    fn test_flush_issues_flush_set() {
        let mut mock = MockCommandExecutor::new();
        mock.expect_execute()
            .withf(|_, args| args[..5] == ["flush", "set", "ip", "ghostwarden", "banned"])
            .times(1)
            .returning(|_, _| Ok(CommandOutput::ok("")));

        sink(mock).flush().unwrap();
    }

    #[test]
    fn test_init_creates_scaffolding_when_probe_fails() {
        let mut mock = MockCommandExecutor::new();

        // Probe: set missing.
        mock.expect_execute()
            .withf(|_, args| args[0] == "list" && args[1] == "set")
            .times(1)
            .returning(|_, _| Ok(CommandOutput::fail("Error: No such file or directory\n")));
        // Table, set, chain creation.
        mock.expect_execute()
            .withf(|_, args| args[0] == "add" && args[1] == "table")
            .times(1)
            .returning(|_, _| Ok(CommandOutput::ok("")));
        mock.expect_execute()
            .withf(|_, args| args[0] == "add" && args[1] == "set")
            .times(1)
            .returning(|_, _| Ok(CommandOutput::ok("")));
        mock.expect_execute()
            .withf(|_, args| args[0] == "add" && args[1] == "chain")
            .times(1)
            .returning(|_, _| Ok(CommandOutput::ok("")));
        // Chain listing without the set reference, then the rule insert.
        mock.expect_execute()
            .withf(|_, args| args[0] == "list" && args[1] == "chain")
            .times(1)
            .returning(|_, _| Ok(CommandOutput::ok("chain input {\n}")));
        mock.expect_execute()
            .withf(|_, args| args[0] == "add" && args[1] == "rule" && args.contains(&"@banned".to_string()))
            .times(1)
            .returning(|_, _| Ok(CommandOutput::ok("")));

        let sink = LocalSink::new(Arc::new(mock), &config());
        assert!(sink.is_ok());
    }

    #[test]
    fn test_init_skips_rule_when_already_referenced() {
        let mut mock = MockCommandExecutor::new();

        mock.expect_execute()
            .withf(|_, args| args[0] == "list" && args[1] == "set")
            .times(1)
            .returning(|_, _| Ok(CommandOutput::ok("set banned { }")));
        mock.expect_execute()
            .withf(|_, args| args[0] == "add" && args[1] == "chain")
            .times(1)
            .returning(|_, _| Ok(CommandOutput::fail("Error: Object exists\n")));
        mock.expect_execute()
            .withf(|_, args| args[0] == "list" && args[1] == "chain")
            .times(1)
            .returning(|_, _| {
                Ok(CommandOutput::ok(
                    "chain input {\n\tip saddr @banned drop\n}",
                ))
            });

        let sink = LocalSink::new(Arc::new(mock), &config());
        assert!(sink.is_ok());
    }
}
