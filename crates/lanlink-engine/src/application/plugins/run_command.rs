//! Remote command execution plugin.
//!
//! The exemplar capability exercising the dispatch contract. A peer asks
//! for the command table with `{"request": "list"}` and receives
//! `{"commandList": { key: {"name": …, "command": …} }}`; it triggers a
//! command with `{"key": …}`. Execution is fire-and-forget: no result
//! packet is sent back.
//!
//! The command table comes from engine configuration. Process spawning is
//! behind the [`CommandRunner`] seam so tests can record invocations
//! instead of forking.

use std::collections::HashMap;
use std::process::Stdio;
use std::sync::Arc;

use async_trait::async_trait;
use lanlink_core::Packet;
use serde_json::{json, Map, Value};
use tracing::{debug, info, warn};

use crate::application::plugins::{Plugin, PluginContext, PluginError, PluginFactory};
use crate::config::CommandEntry;

/// Capability identifier of this plugin.
pub const CAPABILITY: &str = "runcommand";

/// Builds the outbound "list available commands" request packet.
pub fn request_list_packet() -> Packet {
    let mut body = Map::new();
    body.insert("request".to_string(), json!("list"));
    Packet::new(CAPABILITY, body)
}

/// Builds the outbound "execute command by key" packet.
pub fn execute_packet(key: &str) -> Packet {
    let mut body = Map::new();
    body.insert("key".to_string(), json!(key));
    Packet::new(CAPABILITY, body)
}

/// Seam for actually starting a process.
#[async_trait]
pub trait CommandRunner: Send + Sync {
    /// Starts `command` without waiting for it to finish.
    async fn run(&self, name: &str, command: &str) -> Result<(), String>;
}

/// Runs commands through the platform shell, detached.
pub struct SystemCommandRunner;

#[async_trait]
impl CommandRunner for SystemCommandRunner {
    async fn run(&self, name: &str, command: &str) -> Result<(), String> {
        info!("executing command {name:?}: {command}");

        #[cfg(target_os = "windows")]
        let mut cmd = {
            let mut cmd = tokio::process::Command::new("cmd");
            cmd.arg("/C").arg(command);
            cmd
        };

        #[cfg(not(target_os = "windows"))]
        let mut cmd = {
            let mut cmd = tokio::process::Command::new("sh");
            cmd.arg("-c").arg(command);
            cmd
        };

        cmd.stdin(Stdio::null())
            .stdout(Stdio::null())
            .stderr(Stdio::null())
            .spawn()
            .map(|_| ())
            .map_err(|e| e.to_string())
    }
}

/// Factory for per-device run-command plugin instances.
pub struct RunCommandPluginFactory {
    commands: Arc<Vec<CommandEntry>>,
    runner: Arc<dyn CommandRunner>,
}

impl RunCommandPluginFactory {
    /// Factory using the system shell runner.
    pub fn new(commands: Vec<CommandEntry>) -> Self {
        Self::with_runner(commands, Arc::new(SystemCommandRunner))
    }

    /// Factory with an injected runner (tests).
    pub fn with_runner(commands: Vec<CommandEntry>, runner: Arc<dyn CommandRunner>) -> Self {
        Self {
            commands: Arc::new(commands),
            runner,
        }
    }
}

impl PluginFactory for RunCommandPluginFactory {
    fn capability(&self) -> &'static str {
        CAPABILITY
    }

    fn incoming_capabilities(&self) -> Vec<String> {
        vec![CAPABILITY.to_string()]
    }

    fn outgoing_capabilities(&self) -> Vec<String> {
        vec![CAPABILITY.to_string()]
    }

    fn instantiate(&self, ctx: PluginContext) -> Arc<dyn Plugin> {
        Arc::new(RunCommandPlugin {
            ctx,
            commands: self
                .commands
                .iter()
                .map(|c| (c.key.clone(), c.clone()))
                .collect(),
            runner: Arc::clone(&self.runner),
        })
    }
}

/// Run-command handler bound to one device.
pub struct RunCommandPlugin {
    ctx: PluginContext,
    commands: HashMap<String, CommandEntry>,
    runner: Arc<dyn CommandRunner>,
}

impl RunCommandPlugin {
    /// Builds the command-list response body from the configured table.
    fn command_list(&self) -> Value {
        let list: Map<String, Value> = self
            .commands
            .values()
            .map(|c| {
                (
                    c.key.clone(),
                    json!({ "name": c.name, "command": c.command }),
                )
            })
            .collect();
        Value::Object(list)
    }
}

#[async_trait]
impl Plugin for RunCommandPlugin {
    fn capability(&self) -> &'static str {
        CAPABILITY
    }

    async fn handle_packet(&self, packet: &Packet) -> Result<(), PluginError> {
        if packet.body_str("request") == Some("list") {
            let mut body = Map::new();
            body.insert("commandList".to_string(), self.command_list());
            let response = Packet::new(CAPABILITY, body);
            self.ctx.sink.send(&self.ctx.device_id, response).await?;
            return Ok(());
        }

        if let Some(key) = packet.body_str("key") {
            match self.commands.get(key) {
                Some(entry) => {
                    self.runner
                        .run(&entry.name, &entry.command)
                        .await
                        .map_err(PluginError::Runner)?;
                }
                None => {
                    warn!(
                        "device {} asked for unknown command key {key:?}",
                        self.ctx.device_id
                    );
                }
            }
            return Ok(());
        }

        debug!(
            "ignoring runcommand packet with unrecognized body from {}",
            self.ctx.device_id
        );
        Ok(())
    }
}

// ── Tests ─────────────────────────────────────────────────────────────────────
