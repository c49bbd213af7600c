use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use chrono::Utc;
use tokio::sync::{broadcast, RwLock};

use crate::serial::{
    self, LinkEvent, LinkId, LinkStats, SerialDeviceInfo, SerialLinkConfig, SerialTransport, Target,
};
use super::{ConnectionState, LinkError, LinkInfo, Result};

pub const DEFAULT_EVENT_CAPACITY: usize = 1024;

/// Registry of open links.
/// Routes writes, pause/kill requests and recording control to every link a
/// target selects, and fans all link events into one broadcast channel.
pub struct LinkManager {
    links: Arc<RwLock<HashMap<String, Arc<SerialTransport>>>>,
    infos: Arc<RwLock<HashMap<String, LinkInfo>>>,
    events_tx: broadcast::Sender<LinkEvent>,
}

impl LinkManager {
    pub fn new() -> Self {
        let (events_tx, _) = broadcast::channel(DEFAULT_EVENT_CAPACITY);
        Self {
            links: Arc::new(RwLock::new(HashMap::new())),
            infos: Arc::new(RwLock::new(HashMap::new())),
            events_tx,
        }
    }

    /// Enumerate serial ports on this machine
    pub fn discover_ports() -> Result<Vec<SerialDeviceInfo>> {
        Ok(serial::discover_ports()?)
    }

    pub fn subscribe(&self) -> broadcast::Receiver<LinkEvent> {
        self.events_tx.subscribe()
    }

    /// Sender every transport of this manager reports on. Use it to build
    /// transports that are later [`attach`](Self::attach)ed.
    pub fn events_sender(&self) -> broadcast::Sender<LinkEvent> {
        self.events_tx.clone()
    }

    /// Open a serial port and register the new link. A link left behind by
    /// an unplugged device is dropped first.
    pub async fn connect(&self, config: SerialLinkConfig) -> Result<LinkId> {
        self.ensure_free(&config.port).await?;

        let link = config.link_id();
        self.set_state(&link, ConnectionState::Connecting).await;
        log::info!("Attempting to connect to port: {}", link);

        match SerialTransport::open(config, self.events_tx.clone()) {
            Ok(transport) => self.register(transport).await,
            Err(e) => {
                self.set_state(&link, ConnectionState::Error(e.to_string())).await;
                Err(LinkError::SerialError(e))
            }
        }
    }

    /// Register a transport built over some other byte stream
    pub async fn attach(&self, transport: SerialTransport) -> Result<LinkId> {
        self.ensure_free(&transport.config().port).await?;
        self.register(transport).await
    }

    async fn register(&self, transport: SerialTransport) -> Result<LinkId> {
        let link = transport.link().clone();
        let mut links_guard = self.links.write().await;
        if let Some(existing) = find_port(&links_guard, &link.port) {
            transport.kill();
            return Err(LinkError::AlreadyOpen(existing));
        }
        links_guard.insert(link.port.clone(), Arc::new(transport));
        drop(links_guard);

        self.set_state(&link, ConnectionState::Connected).await;
        Ok(link)
    }

    async fn ensure_free(&self, port: &str) -> Result<()> {
        self.reap_dead(port).await;
        let links_guard = self.links.read().await;
        match find_port(&links_guard, port) {
            Some(existing) => Err(LinkError::AlreadyOpen(existing)),
            None => Ok(()),
        }
    }

    /// Forget the link on `port` if its worker has already exited
    async fn reap_dead(&self, port: &str) {
        let dead = {
            let mut links_guard = self.links.write().await;
            match find_port(&links_guard, port) {
                Some(name) if links_guard.get(&name).map_or(false, |t| !t.is_alive()) => links_guard.remove(&name),
                _ => None,
            }
        };
        if let Some(transport) = dead {
            log::info!("Dropping dead link {}", transport.link());
            if let Err(e) = transport.stop_recording() {
                log::warn!("Closing recording of {} failed: {}", transport.link(), e);
            }
            self.set_state(transport.link(), ConnectionState::Disconnected).await;
        }
    }

    async fn set_state(&self, link: &LinkId, state: ConnectionState) {
        let mut infos_guard = self.infos.write().await;
        infos_guard
            .entry(link.port.clone())
            .and_modify(|info| {
                info.link = link.clone();
                info.update_connection_state(state.clone());
            })
            .or_insert_with(|| LinkInfo::new(link.clone(), state));
    }

    /// Every link opened or attempted so far, with live state
    pub async fn links(&self) -> Vec<LinkInfo> {
        let links_guard = self.links.read().await;
        let infos_guard = self.infos.read().await;
        let mut infos: Vec<LinkInfo> = infos_guard
            .iter()
            .map(|(port, info)| {
                let mut info = info.clone();
                if let Some(transport) = links_guard.get(port) {
                    if !transport.is_alive() && info.is_connected() {
                        info.connection_state = ConnectionState::Disconnected;
                    }
                    info.paused = transport.is_paused();
                    info.recording = transport.recording_path();
                    info.stats = transport.stats().borrow().clone();
                }
                info
            })
            .collect();
        infos.sort_by(|a, b| a.link.port.cmp(&b.link.port));
        infos
    }

    pub async fn get(&self, port: &str) -> Option<Arc<SerialTransport>> {
        let links_guard = self.links.read().await;
        links_guard
            .iter()
            .find(|(name, _)| name.eq_ignore_ascii_case(port))
            .map(|(_, transport)| transport.clone())
    }

    pub async fn stats(&self, port: &str) -> Option<LinkStats> {
        self.get(port).await.map(|t| t.stats().borrow().clone())
    }

    /// True when at least one live link matches `target`
    pub async fn is_open(&self, target: &Target) -> bool {
        let links_guard = self.links.read().await;
        links_guard
            .iter()
            .any(|(port, transport)| target.matches_port(port) && transport.is_alive())
    }

    async fn matching(&self, target: &Target) -> Result<Vec<Arc<SerialTransport>>> {
        let links_guard = self.links.read().await;
        let matched: Vec<_> = links_guard
            .iter()
            .filter(|(port, _)| target.matches_port(port))
            .map(|(_, transport)| transport.clone())
            .collect();
        if matched.is_empty() {
            return Err(LinkError::NotConnected(target.clone()));
        }
        Ok(matched)
    }

    /// Write raw bytes to every matching link; returns how many accepted them
    pub async fn write(&self, target: &Target, data: &[u8]) -> Result<usize> {
        let links = self.matching(target).await?;
        Ok(links.iter().filter(|t| t.write(data)).count())
    }

    pub async fn write_text(&self, target: &Target, text: &str) -> Result<usize> {
        let links = self.matching(target).await?;
        Ok(links.iter().filter(|t| t.write_text(text)).count())
    }

    /// Write an encoded frame followed by CR LF
    pub async fn write_frame(&self, target: &Target, frame: &str) -> Result<usize> {
        let mut data = Vec::with_capacity(frame.len() + 2);
        data.extend_from_slice(frame.as_bytes());
        data.extend_from_slice(b"\r\n");
        self.write(target, &data).await
    }

    /// Stop and unregister matching links. Each worker reports
    /// `Disconnected` once its current read returns.
    pub async fn kill(&self, target: &Target) -> Result<Vec<LinkId>> {
        let removed: Vec<Arc<SerialTransport>> = {
            let mut links_guard = self.links.write().await;
            let ports: Vec<String> = links_guard
                .keys()
                .filter(|port| target.matches_port(port))
                .cloned()
                .collect();
            ports.iter().filter_map(|port| links_guard.remove(port)).collect()
        };
        if removed.is_empty() {
            return Err(LinkError::NotConnected(target.clone()));
        }

        let mut killed = Vec::with_capacity(removed.len());
        for transport in removed {
            if let Err(e) = transport.stop_recording() {
                log::warn!("Closing recording of {} failed: {}", transport.link(), e);
            }
            transport.kill();
            self.set_state(transport.link(), ConnectionState::Disconnected).await;
            killed.push(transport.link().clone());
        }
        Ok(killed)
    }

    pub async fn pause(&self, target: &Target) -> Result<()> {
        for transport in self.matching(target).await? {
            transport.pause();
        }
        Ok(())
    }

    pub async fn resume(&self, target: &Target) -> Result<()> {
        for transport in self.matching(target).await? {
            transport.resume();
        }
        Ok(())
    }

    /// Start recording on every matching link. With [`Target::All`] each
    /// file name carries its port.
    pub async fn start_recording(&self, target: &Target, dir: &Path, file_name: &str) -> Result<Vec<PathBuf>> {
        let all_links = matches!(target, Target::All);
        let mut paths = Vec::new();
        for transport in self.matching(target).await? {
            paths.push(transport.start_recording(dir, file_name, all_links)?);
        }
        Ok(paths)
    }

    pub async fn stop_recording(&self, target: &Target) -> Result<Vec<PathBuf>> {
        let mut paths = Vec::new();
        for transport in self.matching(target).await? {
            paths.extend(transport.stop_recording()?);
        }
        Ok(paths)
    }

    pub async fn pause_recording(&self, target: &Target) -> Result<()> {
        for transport in self.matching(target).await? {
            transport.pause_recording();
        }
        Ok(())
    }

    pub async fn resume_recording(&self, target: &Target) -> Result<()> {
        for transport in self.matching(target).await? {
            transport.resume_recording();
        }
        Ok(())
    }

    pub async fn append_to_recording(&self, target: &Target, text: &str) -> Result<()> {
        for transport in self.matching(target).await? {
            transport.append_to_recording(text)?;
        }
        Ok(())
    }

    /// Kill every link and wait for the workers to exit
    pub async fn shutdown(&self) {
        let transports: Vec<Arc<SerialTransport>> = {
            let mut links_guard = self.links.write().await;
            links_guard.drain().map(|(_, transport)| transport).collect()
        };
        if transports.is_empty() {
            return;
        }

        {
            let mut infos_guard = self.infos.write().await;
            for info in infos_guard.values_mut() {
                if info.is_connected() {
                    info.update_connection_state(ConnectionState::Disconnected);
                }
            }
        }

        let joined = tokio::task::spawn_blocking(move || {
            for transport in transports {
                if let Err(e) = transport.stop_recording() {
                    log::warn!("Closing recording of {} failed: {}", transport.link(), e);
                }
                transport.join();
            }
        })
        .await;
        if let Err(e) = joined {
            log::error!("Joining link workers failed: {}", e);
        }
        log::info!("All links closed at {}", Utc::now());
    }
}

impl Default for LinkManager {
    fn default() -> Self {
        Self::new()
    }
}

fn find_port(links: &HashMap<String, Arc<SerialTransport>>, port: &str) -> Option<String> {
    links.keys().find(|name| name.eq_ignore_ascii_case(port)).cloned()
}
