//! A [`RuleStore`] backed by the `iptables` binary.
//!
//! Every operation is a single invocation of the tool with `-w`, so that concurrent invocations
//! from other workers (or other processes) serialize on the xtables lock instead of clobbering
//! each other's changes.

#![deny(rust_2018_idioms)]
#![forbid(unsafe_code)]

mod listing;

pub use self::listing::parse_listing;
use std::{net::IpAddr, time::Duration};
use tokio::time;
use tproxy_controller_core::{FirewallRule, RuleStore, RuleTag, StoreError, REDIRECT_PORTS};
use tracing::{debug, trace};


#[derive(Clone, Debug, PartialEq, Eq)]
pub struct IptablesConfig {
    pub program: String,
    pub table: String,
    pub chain: String,

    /// The local port that redirected traffic is delivered to.
    pub redirect_port: u16,

    /// Bounds each invocation of the tool.
    pub timeout: Duration,
}

#[derive(Clone, Debug)]
pub struct Iptables<R = Process> {
    config: IptablesConfig,
    runner: R,
}

/// The captured result of running a command to completion.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct Output {
    pub success: bool,
    pub status: String,
    pub stdout: String,
    pub stderr: String,
}

/// Runs an external program.
#[async_trait::async_trait]
pub trait Run: Send + Sync {
    async fn run(&self, program: &str, args: &[String]) -> std::io::Result<Output>;
}

/// Runs commands as child processes.
#[derive(Copy, Clone, Debug, Default)]
pub struct Process(());

// === impl IptablesConfig ===

impl Default for IptablesConfig {
    fn default() -> Self {
        Self {
            program: "iptables".to_string(),
            table: "nat".to_string(),
            chain: "PREROUTING".to_string(),
            redirect_port: 8080,
            timeout: Duration::from_secs(10),
        }
    }
}

// === impl Iptables ===

impl Iptables {
    pub fn new(config: IptablesConfig) -> Self {
        Self::with_runner(config, Process(()))
    }
}

impl<R: Run> Iptables<R> {
    pub fn with_runner(config: IptablesConfig, runner: R) -> Self {
        Self { config, runner }
    }

    fn args(&self, op: &str) -> Vec<String> {
        vec![
            "-w".to_string(),
            "-t".to_string(),
            self.config.table.clone(),
            op.to_string(),
            self.config.chain.clone(),
        ]
    }

    fn list_args(&self) -> Vec<String> {
        let mut args = self.args("-L");
        args.extend(["-n".to_string(), "--line-numbers".to_string()]);
        args
    }

    fn append_args(&self, ip: IpAddr, dport: u16, tag: &RuleTag) -> Vec<String> {
        let source = ip.to_string();
        let dport = dport.to_string();
        let to_port = self.config.redirect_port.to_string();
        let mut args = self.args("-A");
        args.extend(
            [
                "-s",
                source.as_str(),
                "-p",
                "tcp",
                "--dport",
                dport.as_str(),
                "-m",
                "comment",
                "--comment",
                tag.as_str(),
                "-j",
                "REDIRECT",
                "--to-ports",
                to_port.as_str(),
            ]
            .map(String::from),
        );
        args
    }

    fn delete_args(&self, position: u32) -> Vec<String> {
        let mut args = self.args("-D");
        args.push(position.to_string());
        args
    }

    async fn exec(&self, args: Vec<String>) -> Result<Output, StoreError> {
        let program = &self.config.program;
        let command = format!("{} {}", program, args.join(" "));
        trace!(%command);

        let output = match time::timeout(self.config.timeout, self.runner.run(program, &args)).await
        {
            Ok(Ok(output)) => output,
            Ok(Err(source)) => return Err(StoreError::Spawn { command, source }),
            Err(_) => {
                return Err(StoreError::Timeout {
                    command,
                    timeout: self.config.timeout,
                })
            }
        };

        if !output.success {
            return Err(StoreError::Exit {
                command,
                status: output.status,
                stderr: output.stderr.trim().to_string(),
            });
        }

        debug!(%command, "Ran");
        Ok(output)
    }
}

#[async_trait::async_trait]
impl<R: Run> RuleStore for Iptables<R> {
    async fn inspect(&self, tag: &RuleTag) -> Result<Vec<FirewallRule>, StoreError> {
        let output = self.exec(self.list_args()).await?;
        let mut rules = parse_listing(&output.stdout, tag)?;
        rules.reverse();
        Ok(rules)
    }

    async fn add(&self, ip: IpAddr, tag: &RuleTag) -> Result<(), StoreError> {
        for dport in REDIRECT_PORTS {
            self.exec(self.append_args(ip, dport, tag)).await?;
        }
        Ok(())
    }

    async fn remove(&self, position: u32) -> Result<(), StoreError> {
        self.exec(self.delete_args(position)).await?;
        Ok(())
    }
}

// === impl Process ===

#[async_trait::async_trait]
impl Run for Process {
    async fn run(&self, program: &str, args: &[String]) -> std::io::Result<Output> {
        // A timed-out invocation is dropped; make sure the child goes with it.
        let output = tokio::process::Command::new(program)
            .args(args)
            .kill_on_drop(true)
            .output()
            .await?;
        Ok(Output {
            success: output.status.success(),
            status: output.status.to_string(),
            stdout: String::from_utf8_lossy(&output.stdout).into_owned(),
            stderr: String::from_utf8_lossy(&output.stderr).into_owned(),
        })
    }
}
