//! Interactive command shell over stdin, managing a node pool through the
//! controller.

use anyhow::Context;
use tokio::io::{AsyncBufReadExt, BufReader};

use crate::controller::Controller;
use crate::core::identifier::SwarmId;

const HELP: &str = "\
Available commands:
  hl, host, host-local <file>       host a local file
  jr, join-remote <id-hex> <file>   fetch a swarm's value into a file
  ls, lvn, list-virtual-nodes       list hosted virtual nodes
  h, help                           print this help message
  e, q, exit                        exit program";

pub struct Shell {
    controller: Controller,
}

impl Shell {
    pub fn new(controller: Controller) -> Self {
        Self { controller }
    }

    pub fn controller(&self) -> &Controller {
        &self.controller
    }

    /// Read commands from stdin until exit or EOF.
    pub async fn run(&self) -> anyhow::Result<()> {
        let mut lines = BufReader::new(tokio::io::stdin()).lines();
        println!("Enter commands:");
        while let Some(line) = lines.next_line().await? {
            let line = line.trim();
            if matches!(line, "exit" | "e" | "q") {
                break;
            }
            if line.is_empty() {
                continue;
            }
            if let Err(e) = self.handle(line).await {
                println!("error: {e:#}");
            }
        }
        Ok(())
    }

    pub async fn handle(&self, line: &str) -> anyhow::Result<()> {
        let mut parts = line.split_whitespace();
        let name = parts.next().unwrap_or_default();
        let args: Vec<&str> = parts.collect();
        match (name, args.as_slice()) {
            ("host-local" | "hl" | "host", [path]) => self.host_local_file(path).await,
            ("join-remote" | "jr", [id_hex, path]) => self.join_remote(id_hex, path).await,
            ("list-virtual-nodes" | "lvn" | "ls", []) => {
                self.list_virtual_nodes();
                Ok(())
            }
            ("help" | "h", []) => {
                println!("{HELP}");
                Ok(())
            }
            _ => {
                println!("Unknown command. Type \"help\" to get a list of available commands.");
                Ok(())
            }
        }
    }

    async fn host_local_file(&self, path: &str) -> anyhow::Result<()> {
        let data = tokio::fs::read(path)
            .await
            .with_context(|| format!("reading {path}"))?;
        let node = self.controller.host(data)?;
        println!("added virtual node for {path}: {}", node.id().to_hex());
        Ok(())
    }

    async fn join_remote(&self, id_hex: &str, path: &str) -> anyhow::Result<()> {
        let id = SwarmId::from_hex(id_hex)?;
        let value = self.controller.fetch(id).await?;
        // recompute the checksum before anything touches the disk
        anyhow::ensure!(
            SwarmId::from_value(&value) == id,
            "checksum mismatch for {}",
            id.to_hex()
        );
        tokio::fs::write(path, &value)
            .await
            .with_context(|| format!("writing {path}"))?;
        println!("saved {} bytes to {path}: {}", value.len(), id.to_hex());
        Ok(())
    }

    fn list_virtual_nodes(&self) {
        let display = |node: &Option<crate::core::identifier::RemoteNode>| match node {
            Some(node) => node.to_string(),
            None => "-".to_string(),
        };
        for status in self.controller.statuses() {
            println!("{} has content: {}", status.id.to_hex(), status.has_value);
            println!(
                "  predecessor: {}, successor: {}",
                display(&status.predecessor),
                display(&status.successor)
            );
            for (k, finger) in &status.fingers {
                println!("  finger {k}: {finger}");
            }
            for member in &status.swarm {
                println!("  swarm: {member}");
            }
        }
    }
}
