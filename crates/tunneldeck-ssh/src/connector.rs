//! The connection orchestrator.
//!
//! [`Connector`] owns the tunnel tree and every running client process. All
//! state changes happen on the task that drives [`Connector::run_until`] (or
//! [`Connector::step`]); reader, waiter, timer and populate tasks only post
//! [`EngineEvent`]s to its channel.

use crate::command::{
    build_command, parse_plink_version, version_check, ClientVersion, ResolvedTunnel,
};
use crate::error::{Result, SshError};
use crate::event::{
    CapturedOutput, EngineEvent, EventReceiver, EventSender, ProcessTag, StatusChange,
};
use crate::populate::{parse_output, plan_merge, PopulateData};
use crate::process::{CommandLine, Launcher, TunnelProcess};
use crate::prompt::{PromptRequest, Prompter};
use crate::reconnect::ReconnectScheduler;
use crate::scanner::{classify_line, decide, LineSplitter, ScanAction, StoredSecrets, ANSWER_EOL};
use std::collections::{HashMap, HashSet};
use std::future::Future;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{broadcast, mpsc};
use tracing::{debug, info, warn};
use tunneldeck_core::config::{AppConfig, BackupHook, ClientKind};
use tunneldeck_core::ports::{find_port_conflict, EditFormPorts, PortAllocator, PortTarget};
use tunneldeck_core::variables::{BuiltinValues, VariableResolver};
use tunneldeck_core::{ConnectStatus, CredentialStore, LogBuffer, TunnelTree, VariableSet};
use uuid::Uuid;

const SECRET_MASK: &str = "********";

/// Collaborators injected at construction.
pub struct ConnectorServices {
    pub variables: VariableSet,
    pub credentials: Box<dyn CredentialStore + Send>,
    pub config: AppConfig,
    pub prompter: Box<dyn Prompter>,
    pub launcher: Arc<dyn Launcher>,
    pub backup: Box<dyn BackupHook>,
    pub app_dir: PathBuf,
    pub data_dir: PathBuf,
}

/// What a connect request led to.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectOutcome {
    /// Every requested tunnel was already Connecting or Connected.
    AlreadyActive,
    /// At least one requested tunnel was spawned.
    Spawned,
    /// Marked; waiting for a parent tunnel to come up.
    Waiting,
    /// Nothing could be started; see the node log.
    Failed,
}

struct RunningProcess {
    generation: u64,
    process: Box<dyn TunnelProcess>,
    splitter: LineSplitter,
    password: String,
    key_passphrase: String,
}

pub struct Connector {
    tree: TunnelTree,
    variables: VariableSet,
    credentials: Box<dyn CredentialStore + Send>,
    config: AppConfig,
    prompter: Box<dyn Prompter>,
    launcher: Arc<dyn Launcher>,
    backup: Box<dyn BackupHook>,
    app_dir: PathBuf,
    data_dir: PathBuf,
    processes: HashMap<Uuid, RunningProcess>,
    next_generation: u64,
    reconnect: ReconnectScheduler,
    events_tx: EventSender,
    events_rx: EventReceiver,
    status_tx: broadcast::Sender<StatusChange>,
    plink_versions: HashMap<String, Option<ClientVersion>>,
    populating: HashSet<Uuid>,
}

impl Connector {
    pub fn new(mut tree: TunnelTree, services: ConnectorServices) -> Self {
        let capacity = services.config.log.max_log_lines;
        for id in tree.walk(None) {
            if let Some(node) = tree.get_mut(id) {
                node.log = LogBuffer::with_capacity(capacity);
            }
        }

        let (events_tx, events_rx) = mpsc::unbounded_channel();
        let (status_tx, _) = broadcast::channel(256);
        Self {
            tree,
            variables: services.variables,
            credentials: services.credentials,
            config: services.config,
            prompter: services.prompter,
            launcher: services.launcher,
            backup: services.backup,
            app_dir: services.app_dir,
            data_dir: services.data_dir,
            processes: HashMap::new(),
            next_generation: 0,
            reconnect: ReconnectScheduler::new(),
            events_tx,
            events_rx,
            status_tx,
            plink_versions: HashMap::new(),
            populating: HashSet::new(),
        }
    }

    pub fn tree(&self) -> &TunnelTree {
        &self.tree
    }

    pub fn config(&self) -> &AppConfig {
        &self.config
    }

    pub fn status(&self, id: Uuid) -> Option<ConnectStatus> {
        self.tree.get(id).map(|n| n.status)
    }

    pub fn log(&self, id: Uuid) -> Option<&LogBuffer> {
        self.tree.get(id).map(|n| &n.log)
    }

    pub fn subscribe(&self) -> broadcast::Receiver<StatusChange> {
        self.status_tx.subscribe()
    }

    pub fn has_process(&self, id: Uuid) -> bool {
        self.processes.contains_key(&id)
    }

    pub fn is_reconnect_armed(&self, id: Uuid) -> bool {
        self.reconnect.is_armed(id)
    }

    pub fn is_populating(&self) -> bool {
        !self.populating.is_empty()
    }

    pub fn propose_port(
        &self,
        target: PortTarget,
        form: Option<&EditFormPorts>,
        exclude: &[u16],
    ) -> u16 {
        PortAllocator::new(&self.tree).propose(target, form, exclude)
    }

    // --- Event loop ---

    /// Handle events until `shutdown` completes.
    pub async fn run_until<F>(&mut self, shutdown: F)
    where
        F: Future<Output = ()>,
    {
        tokio::pin!(shutdown);
        loop {
            tokio::select! {
                _ = &mut shutdown => break,
                event = self.events_rx.recv() => match event {
                    Some(event) => self.handle_event(event).await,
                    None => break,
                },
            }
        }
    }

    /// Wait for and handle a single event.
    pub async fn step(&mut self) -> bool {
        match self.events_rx.recv().await {
            Some(event) => {
                self.handle_event(event).await;
                true
            }
            None => false,
        }
    }

    pub async fn handle_event(&mut self, event: EngineEvent) {
        match event {
            EngineEvent::Output { tag, data } => self.on_output(tag, &data).await,
            EngineEvent::Exited { tag, code } => self.on_exit(tag, code),
            EngineEvent::ReconnectDue { node, token } => self.on_reconnect_due(node, token).await,
            EngineEvent::PopulateFinished { folder, result } => {
                self.on_populate_finished(folder, result).await
            }
        }
    }

    // --- Connect ---

    /// Mark `id` (or every tunnel below a folder) and its parent chain, then
    /// spawn whatever is ready.
    pub async fn request_connect(&mut self, id: Uuid) -> Result<ConnectOutcome> {
        let targets = self.connect_targets(id)?;
        if targets.iter().all(|t| self.is_active(*t)) {
            return Ok(ConnectOutcome::AlreadyActive);
        }
        for &target in &targets {
            if let Some(node) = self.tree.get_mut(target) {
                if !node.status.is_active() {
                    node.retry_count = 0;
                    node.skip_parent_chain = false;
                }
            }
            self.mark_chain(target);
        }
        self.crawl_connect(None).await;
        Ok(self.outcome(&targets))
    }

    /// Spawn `id` now, ignoring whether its parent tunnel is up.
    pub async fn connect_direct(&mut self, id: Uuid) -> Result<ConnectOutcome> {
        let node = self.tree.get_mut(id).ok_or(SshError::NodeNotFound(id))?;
        if !node.is_tunnel() {
            return self.request_connect(id).await;
        }
        if node.status.is_active() {
            return Ok(ConnectOutcome::AlreadyActive);
        }
        node.retry_count = 0;
        node.skip_parent_chain = true;
        self.mark(id);
        self.spawn_node(id).await;
        Ok(self.outcome(&[id]))
    }

    /// Depth-first over `root` (or the whole tree), spawning every marked
    /// tunnel whose effective parent is absent or connected.
    pub async fn crawl_connect(&mut self, root: Option<Uuid>) {
        for id in self.tree.walk(root) {
            let ready = match self.tree.get(id) {
                Some(node) if node.is_tunnel() && node.status == ConnectStatus::MarkedForConnect => {
                    node.skip_parent_chain || self.parent_ready(id)
                }
                _ => false,
            };
            if ready {
                self.spawn_node(id).await;
            }
        }
    }

    fn connect_targets(&self, id: Uuid) -> Result<Vec<Uuid>> {
        let node = self.tree.get(id).ok_or(SshError::NodeNotFound(id))?;
        if node.is_tunnel() {
            return Ok(vec![id]);
        }
        Ok(self
            .tree
            .descendants(id)
            .into_iter()
            .filter(|d| self.tree.get(*d).is_some_and(|n| n.is_tunnel()))
            .collect())
    }

    fn is_active(&self, id: Uuid) -> bool {
        self.tree.get(id).is_some_and(|n| n.status.is_active())
    }

    fn parent_ready(&self, id: Uuid) -> bool {
        match self.tree.effective_parent_tunnel(id) {
            None => true,
            Some(p) => self.status(p) == Some(ConnectStatus::Connected),
        }
    }

    /// Mark one node. Returns false when it is already on its way.
    fn mark(&mut self, id: Uuid) -> bool {
        match self.tree.get_mut(id) {
            Some(node) if !node.status.is_active() => node.should_reconnect = true,
            _ => return false,
        }
        self.set_status(id, ConnectStatus::MarkedForConnect);
        true
    }

    fn mark_chain(&mut self, id: Uuid) {
        if !self.mark(id) {
            return;
        }
        let mut cursor = self.tree.effective_parent_tunnel(id);
        while let Some(parent) = cursor {
            if !self.mark(parent) {
                debug!("Parent of {} is already connecting", id);
                break;
            }
            cursor = self.tree.effective_parent_tunnel(parent);
        }
    }

    fn outcome(&self, targets: &[Uuid]) -> ConnectOutcome {
        let statuses: Vec<ConnectStatus> = targets.iter().filter_map(|t| self.status(*t)).collect();
        if statuses.iter().any(|s| s.is_active()) {
            ConnectOutcome::Spawned
        } else if statuses.contains(&ConnectStatus::MarkedForConnect) {
            ConnectOutcome::Waiting
        } else {
            ConnectOutcome::Failed
        }
    }

    async fn spawn_node(&mut self, id: Uuid) {
        if let Err(e) = self.try_spawn(id).await {
            let name = self.node_name(id);
            warn!("Failed to start '{}': {}", name, e);
            self.log_node(id, format!("Connect failed: {}", e));
            if e.is_config_error() {
                self.prompter
                    .show_error(&format!("Cannot connect '{}'", name), &e.to_string());
            }
            if let Some(node) = self.tree.get_mut(id) {
                node.should_reconnect = false;
            }
            self.set_status(id, ConnectStatus::Disconnected);
            self.release_marked_descendants(id);
        }
    }

    async fn try_spawn(&mut self, id: Uuid) -> Result<()> {
        // Resolve before touching the node so a configuration error leaves it as it was.
        let mut built = self.build_for(id).await?;
        if self.assign_missing_port(id)? {
            built = self.build_for(id).await?;
        }
        if let Some(conflict) = find_port_conflict(&self.tree, id) {
            return Err(SshError::PortInUse {
                port: conflict.port,
                holder: self.node_name(conflict.holder),
            });
        }

        let (command, resolved) = built;
        self.next_generation += 1;
        let tag = ProcessTag {
            node: id,
            generation: self.next_generation,
        };
        let process = self.launcher.launch(&command, tag, self.events_tx.clone())?;

        let auto_clear = self.config.log.auto_clear_log;
        if let Some(node) = self.tree.get_mut(id) {
            if auto_clear {
                node.log.clear();
            }
            node.prompt_counters.reset();
        }
        self.log_node(id, format!("Starting: {}", command.display()));
        if let Some(pid) = process.pid() {
            self.log_node(id, format!("Started process {}", pid));
        }
        self.processes.insert(
            id,
            RunningProcess {
                generation: tag.generation,
                process,
                splitter: LineSplitter::new(),
                password: resolved.password,
                key_passphrase: resolved.key_passphrase,
            },
        );
        self.set_status(id, ConnectStatus::Connecting);
        Ok(())
    }

    /// Give a tunnel without a local port a proposed one. Returns whether
    /// a port was assigned.
    fn assign_missing_port(&mut self, id: Uuid) -> Result<bool> {
        let node = self.tree.get(id).ok_or(SshError::NodeNotFound(id))?;
        if node.config.local_port != 0 || node.config.remote_port == 0 {
            return Ok(false);
        }
        let port = PortAllocator::new(&self.tree).propose(PortTarget::Existing(id), None, &[]);
        if port == 0 {
            return Err(SshError::NoFreePort(node.name().to_string()));
        }
        if let Some(node) = self.tree.get_mut(id) {
            node.config.local_port = port;
        }
        self.log_node(id, format!("Assigned local port {}", port));
        Ok(true)
    }

    async fn build_for(&mut self, id: Uuid) -> Result<(CommandLine, ResolvedTunnel)> {
        let config = self
            .tree
            .get(id)
            .ok_or(SshError::NodeNotFound(id))?
            .config
            .clone();
        let resolved = ResolvedTunnel::resolve(
            &config,
            &self.variables,
            self.credentials.as_ref(),
            &self.app_dir,
            &self.data_dir,
        )?;
        let client = self.config.client.kind;
        let version = match client {
            ClientKind::Plink => self.plink_version().await,
            ClientKind::OpenSsh | ClientKind::SshPass => None,
        };
        let command = build_command(client, &resolved, &self.variables, version)?;
        Ok((command, resolved))
    }

    /// The command line `id` would be started with.
    pub async fn command_line(&mut self, id: Uuid) -> Result<CommandLine> {
        Ok(self.build_for(id).await?.0)
    }

    async fn plink_version(&mut self) -> Option<ClientVersion> {
        let check = version_check(&self.variables);
        if let Some(version) = self.plink_versions.get(&check.program) {
            return *version;
        }
        let timeout = Duration::from_millis(self.config.client.version_check_timeout_ms);
        let version = match self.launcher.run_captured(&check, timeout).await {
            Ok(out) => parse_plink_version(&out.output),
            Err(e) => {
                debug!("plink version check failed: {}", e);
                None
            }
        };
        match version {
            Some(v) => info!("Using plink {}.{}", v.major, v.minor),
            None => info!("plink version unknown, assuming a release before 0.82"),
        }
        self.plink_versions.insert(check.program, version);
        version
    }

    // --- Process events ---

    fn is_current(&self, tag: ProcessTag) -> bool {
        self.processes
            .get(&tag.node)
            .is_some_and(|p| p.generation == tag.generation)
    }

    async fn on_output(&mut self, tag: ProcessTag, data: &str) {
        let lines = match self.processes.get_mut(&tag.node) {
            Some(running) if running.generation == tag.generation => running.splitter.feed(data),
            _ => return,
        };
        for line in lines {
            if !self.is_current(tag) {
                break;
            }
            self.log_node(tag.node, line.clone());
            self.handle_line(tag, &line).await;
        }
    }

    async fn handle_line(&mut self, tag: ProcessTag, line: &str) {
        let class = classify_line(line);
        let action = {
            let (Some(running), Some(node)) =
                (self.processes.get(&tag.node), self.tree.get_mut(tag.node))
            else {
                return;
            };
            let secrets = StoredSecrets {
                password: Some(running.password.as_str()),
                key_passphrase: Some(running.key_passphrase.as_str()),
            };
            decide(class, &mut node.prompt_counters, secrets)
        };

        match action {
            ScanAction::Send { text, secret } => self.send_answer(tag.node, &text, secret).await,
            ScanAction::Ask(kind) => {
                let request = PromptRequest {
                    node: tag.node,
                    node_name: self.node_name(tag.node),
                    kind,
                    prompt: line.to_string(),
                };
                match self.prompter.ask(&request) {
                    Some(answer) => self.send_answer(tag.node, &answer, kind.is_secret()).await,
                    None => {
                        self.log_node(
                            tag.node,
                            format!("{} prompt cancelled, disconnecting", kind.label()),
                        );
                        if let Some(node) = self.tree.get_mut(tag.node) {
                            node.should_reconnect = false;
                        }
                        self.terminate(tag.node);
                    }
                }
            }
            ScanAction::Connected => self.on_connected(tag.node).await,
            ScanAction::Kill => {
                self.log_node(tag.node, "Fatal client message, terminating");
                self.terminate(tag.node);
            }
            ScanAction::Ignore => {}
        }
    }

    async fn send_answer(&mut self, id: Uuid, text: &str, secret: bool) {
        let shown = if secret && self.config.log.hide_passwords_in_log {
            SECRET_MASK.to_string()
        } else {
            text.to_string()
        };
        let Some(running) = self.processes.get_mut(&id) else {
            return;
        };
        let payload = format!("{}{}", text, ANSWER_EOL);
        match running.process.write(payload.as_bytes()).await {
            Ok(()) => self.log_node(id, format!("Sent: {}", shown)),
            Err(e) => {
                warn!("Failed to answer prompt of '{}': {}", self.node_name(id), e);
                self.log_node(id, format!("Failed to send answer: {}", e));
            }
        }
    }

    /// Ask the process to exit; its exit event drives the state machine.
    fn terminate(&mut self, id: Uuid) {
        if let Some(running) = self.processes.get_mut(&id) {
            if let Err(e) = running.process.terminate() {
                warn!("Failed to terminate '{}': {}", self.node_name(id), e);
            }
        }
    }

    async fn on_connected(&mut self, id: Uuid) {
        if self.status(id) == Some(ConnectStatus::Connected) {
            return;
        }
        self.reconnect.cancel(id);
        if let Some(node) = self.tree.get_mut(id) {
            node.retry_count = 0;
            node.prompt_counters.reset();
        }
        self.set_status(id, ConnectStatus::Connected);
        self.log_node(id, "Connected");
        self.crawl_connect(Some(id)).await;
    }

    fn on_exit(&mut self, tag: ProcessTag, code: Option<i32>) {
        if !self.is_current(tag) {
            debug!("Ignoring exit of stale process for {}", tag.node);
            return;
        }
        let Some(mut running) = self.processes.remove(&tag.node) else {
            return;
        };
        let id = tag.node;
        if let Some(rest) = running.splitter.finish() {
            self.log_node(id, rest);
        }
        self.set_status(id, ConnectStatus::Disconnected);
        self.log_node(
            id,
            match code {
                Some(code) => format!("Process exited with code {}", code),
                None => "Process terminated".to_string(),
            },
        );

        let Some(node) = self.tree.get_mut(id) else {
            return;
        };
        let retries = node.retry_count;
        if node.should_reconnect && node.config.auto_reconnect && self.config.allows_reconnect(retries) {
            node.retry_count += 1;
            let secs = self.config.connection.reconnect_interval_secs;
            self.log_node(
                id,
                format!(
                    "Reconnecting in {}s (attempt {}/{})",
                    secs,
                    retries + 1,
                    self.config.connection.max_reconnect_attempts
                ),
            );
            self.reconnect
                .arm(id, Duration::from_secs(secs), &self.events_tx);
        } else {
            let was_wanted = node.should_reconnect;
            node.should_reconnect = false;
            if was_wanted && retries > 0 {
                self.log_node(id, format!("Giving up after {} reconnect attempts", retries));
            } else {
                self.log_node(id, "Connection closed");
            }
            info!("'{}' disconnected", self.node_name(id));
            self.release_marked_descendants(id);
        }
    }

    async fn on_reconnect_due(&mut self, id: Uuid, token: u64) {
        if !self.reconnect.fire(id, token) || self.processes.contains_key(&id) {
            return;
        }
        let skip_chain = match self.tree.get(id) {
            Some(node) if node.should_reconnect => node.skip_parent_chain,
            _ => return,
        };
        self.log_node(id, "Reconnecting");
        if skip_chain {
            self.mark(id);
            self.spawn_node(id).await;
        } else {
            self.mark_chain(id);
            self.crawl_connect(None).await;
        }
    }

    /// Unmark descendants left waiting on a parent that will not come up.
    fn release_marked_descendants(&mut self, id: Uuid) {
        let parent = self.node_name(id);
        for d in self.tree.descendants(id) {
            if self.status(d) == Some(ConnectStatus::MarkedForConnect) {
                if let Some(node) = self.tree.get_mut(d) {
                    node.should_reconnect = false;
                }
                self.log_node(d, format!("Not connecting: parent '{}' is down", parent));
                self.set_status(d, ConnectStatus::Disconnected);
            }
        }
    }

    // --- Disconnect and delete ---

    /// Disconnect `id` and everything below it, children first.
    pub async fn disconnect(&mut self, id: Uuid) -> Result<()> {
        if !self.tree.contains(id) {
            return Err(SshError::NodeNotFound(id));
        }
        let mut order = self.tree.walk(Some(id));
        order.reverse();
        for node in order {
            self.disconnect_one(node).await;
        }
        Ok(())
    }

    pub async fn disconnect_all(&mut self) {
        for root in self.tree.roots().to_vec() {
            if let Err(e) = self.disconnect(root).await {
                warn!("Failed to disconnect {}: {}", self.node_name(root), e);
            }
        }
    }

    async fn disconnect_one(&mut self, id: Uuid) {
        self.reconnect.cancel(id);
        if let Some(node) = self.tree.get_mut(id) {
            node.should_reconnect = false;
            node.skip_parent_chain = false;
        }
        if let Some(mut running) = self.processes.remove(&id) {
            let name = self.node_name(id);
            self.log_node(id, "Disconnecting");
            if let Err(e) = running.process.terminate() {
                warn!("Failed to terminate '{}': {}", name, e);
            }
            let wait = Duration::from_millis(self.config.client.kill_wait_ms);
            if !running.process.wait_exit(wait).await {
                if let Err(e) = running.process.force_kill() {
                    warn!("Failed to kill '{}': {}", name, e);
                }
            }
        }
        self.set_status(id, ConnectStatus::Disconnected);
    }

    /// Disconnect and remove a node with its subtree. Returns the number of
    /// removed nodes.
    pub async fn delete_node(&mut self, id: Uuid) -> Result<usize> {
        self.disconnect(id).await?;
        self.backup.backup(&self.tree);
        let name = self.node_name(id);
        let removed = self.tree.remove(id)?;
        info!("Deleted '{}' ({} nodes)", name, removed.len());
        Ok(removed.len())
    }

    // --- Populate ---

    /// Run the folder's child command in the background.
    pub fn refresh_folder(&mut self, folder: Uuid) -> Result<()> {
        let command = {
            let node = self.tree.get(folder).ok_or(SshError::NodeNotFound(folder))?;
            if node.is_tunnel() || node.config.child_command.trim().is_empty() {
                return Err(SshError::NotPopulatable(node.name().to_string()));
            }
            let resolver = VariableResolver::new()
                .with_builtins(BuiltinValues::for_tunnel(
                    &node.config,
                    &self.app_dir,
                    &self.data_dir,
                ))
                .with_credentials(self.credentials.as_ref())
                .with_variables(&self.variables);
            let mut words = resolver.resolve_args(&node.config.child_command)?;
            if words.is_empty() {
                return Err(SshError::NotPopulatable(node.name().to_string()));
            }
            let mut command = CommandLine::new(words.remove(0));
            command.args(words);
            command
        };

        self.log_node(folder, format!("Populating: {}", command.display()));
        self.populating.insert(folder);
        let launcher = Arc::clone(&self.launcher);
        let events = self.events_tx.clone();
        let timeout = Duration::from_secs(self.config.client.populate_timeout_secs);
        tokio::spawn(async move {
            let result = launcher
                .run_captured(&command, timeout)
                .await
                .map_err(|e| e.to_string());
            let _ = events.send(EngineEvent::PopulateFinished { folder, result });
        });
        Ok(())
    }

    /// Start populating every folder with a child command. Returns how many started.
    pub fn refresh_all(&mut self) -> usize {
        let folders: Vec<Uuid> = self
            .tree
            .walk(None)
            .into_iter()
            .filter(|id| {
                self.tree
                    .get(*id)
                    .is_some_and(|n| !n.is_tunnel() && !n.config.child_command.trim().is_empty())
            })
            .collect();
        folders
            .into_iter()
            .filter(|f| match self.refresh_folder(*f) {
                Ok(()) => true,
                Err(e) => {
                    warn!("Cannot populate {}: {}", f, e);
                    false
                }
            })
            .count()
    }

    async fn on_populate_finished(&mut self, folder: Uuid, result: std::result::Result<CapturedOutput, String>) {
        self.populating.remove(&folder);
        if !self.tree.contains(folder) {
            return;
        }
        let out = match result {
            Ok(out) => out,
            Err(e) => {
                self.log_node(folder, format!("Populate command failed: {}", e));
                return;
            }
        };
        let data = match parse_output(&out.output) {
            Ok(data) => data,
            Err(e) => {
                self.log_node(folder, e.to_string());
                return;
            }
        };
        if data.hosts.is_empty() && !out.success() {
            self.log_node(
                folder,
                format!(
                    "Populate command exited with {:?} and no hosts; children kept",
                    out.code
                ),
            );
            return;
        }
        self.apply_populate(folder, data).await;
    }

    async fn apply_populate(&mut self, folder: Uuid, data: PopulateData) {
        let plan = plan_merge(&self.tree, folder, &data);
        if !plan.remove.is_empty() || !plan.insert.is_empty() {
            self.backup.backup(&self.tree);
        }

        for id in &plan.remove {
            let _ = self.disconnect(*id).await;
            if let Err(e) = self.tree.remove(*id) {
                warn!("Failed to remove populated child {}: {}", id, e);
            }
        }
        let capacity = self.config.log.max_log_lines;
        let mut added = 0;
        for host in plan.insert {
            match self.tree.insert(Some(folder), host) {
                Ok(id) => {
                    added += 1;
                    if let Some(node) = self.tree.get_mut(id) {
                        node.log = LogBuffer::with_capacity(capacity);
                    }
                }
                Err(e) => warn!("Failed to add populated child: {}", e),
            }
        }
        if let (Some(tooltip), Some(node)) = (data.tooltip, self.tree.get_mut(folder)) {
            node.config.tooltip = tooltip;
        }
        self.log_node(
            folder,
            format!(
                "Populated: {} kept, {} removed, {} added",
                plan.keep.len(),
                plan.remove.len(),
                added
            ),
        );
    }

    // --- Helpers ---

    fn node_name(&self, id: Uuid) -> String {
        self.tree
            .get(id)
            .map(|n| n.name().to_string())
            .unwrap_or_else(|| id.to_string())
    }

    fn log_node(&mut self, id: Uuid, text: impl Into<String>) {
        let text = text.into();
        if let Some(node) = self.tree.get_mut(id) {
            debug!("[{}] {}", node.name(), text);
            node.log.push(text);
        }
    }

    fn set_status(&mut self, id: Uuid, status: ConnectStatus) {
        let Some(node) = self.tree.get_mut(id) else {
            return;
        };
        if node.status == status {
            return;
        }
        node.status = status;
        info!("'{}' is {}", node.name(), status.label());
        let _ = self.status_tx.send(StatusChange {
            node: id,
            name: node.name().to_string(),
            status,
        });
    }
}
