use std::sync::Arc;

use crate::analysis::NativeImageAnalyzer;
use crate::catalog::CatalogStore;
use crate::config::BridgeConfig;
use crate::host::HostClient;
use crate::mailbox::status::{SharedStatusSink, StatusChannel};
use crate::mailbox::MailboxChannel;
use crate::monitor::{MonitorSettings, QueueMonitor};
use crate::tools::{Dispatcher, ToolContext, ToolRegistry};
use crate::upload::RcloneUploader;

/// Process-wide wiring: one mailbox channel, one status channel and one
/// dispatcher, shared by the stdio surface and the queue monitor.
pub struct Bridge {
    config: BridgeConfig,
    mailbox: Arc<MailboxChannel>,
    status: Arc<StatusChannel>,
    dispatcher: Arc<Dispatcher>,
}

impl Bridge {
    pub fn from_config(config: BridgeConfig) -> Self {
        let mailbox = Arc::new(MailboxChannel::from_config(&config));
        let status = Arc::new(StatusChannel::new(mailbox.layout()));
        let context = ToolContext {
            host: HostClient::new(mailbox.clone()),
            catalog: CatalogStore::from_config(&config),
            analyzer: Arc::new(NativeImageAnalyzer::with_editor(
                config.editor_command.clone(),
            )),
            uploader: Arc::new(RcloneUploader::from_config(&config)),
            default_remote: config.default_remote.clone(),
            style_dir: config.mcp_dir().join("styles"),
        };
        let dispatcher = Arc::new(Dispatcher::new(ToolRegistry::standard(), context));
        Self {
            config,
            mailbox,
            status,
            dispatcher,
        }
    }

    pub fn config(&self) -> &BridgeConfig {
        &self.config
    }

    pub fn mailbox(&self) -> &Arc<MailboxChannel> {
        &self.mailbox
    }

    pub fn status(&self) -> &Arc<StatusChannel> {
        &self.status
    }

    pub fn dispatcher(&self) -> &Arc<Dispatcher> {
        &self.dispatcher
    }

    pub fn monitor(&self) -> QueueMonitor {
        let status: SharedStatusSink = self.status.clone();
        QueueMonitor::new(
            self.mailbox.layout().clone(),
            self.dispatcher.clone(),
            status,
            MonitorSettings::from_config(&self.config),
        )
    }
}
