use async_trait::async_trait;
use tracing::debug;

use crate::sink::presentation::Presentation;
use crate::sink::{MessageSink, SinkError};
use crate::stream::proto::NotificationMessage;

pub type TabId = u64;
pub type GroupId = u64;

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct TabGroup {
    pub id: GroupId,
    pub title: String,
}

/// Browser surface able to open tabs and manage tab groups.
#[async_trait]
pub trait TabHost: Send + Sync {
    /// Opens a new tab on `url`.
    async fn create_tab(&self, url: &str) -> Result<TabId, SinkError>;

    /// Lists existing tab groups.
    async fn tab_groups(&self) -> Result<Vec<TabGroup>, SinkError>;

    /// Moves a tab into an existing group.
    async fn add_to_group(&self, tab: TabId, group: GroupId) -> Result<(), SinkError>;

    /// Creates a new group titled `title` holding `tab`.
    async fn create_group(&self, tab: TabId, title: &str) -> Result<GroupId, SinkError>;
}

/// Opens every presentable notification in a tab grouped under its topic.
#[derive(Debug)]
pub struct TabSink<H> {
    host: H,
}

impl<H: TabHost> TabSink<H> {
    pub fn new(host: H) -> Self {
        Self { host }
    }

    pub fn host(&self) -> &H {
        &self.host
    }

    async fn open_in_group(&self, url: &str, topic: &str) -> Result<(), SinkError> {
        let tab = self.host.create_tab(url).await?;
        let existing = self
            .host
            .tab_groups()
            .await?
            .into_iter()
            .find(|group| group.title == topic);

        match existing {
            Some(group) => self.host.add_to_group(tab, group.id).await,
            None => {
                let group = self.host.create_group(tab, topic).await?;
                debug!(event = "tab_group_created", group, topic);
                Ok(())
            }
        }
    }
}

#[async_trait]
impl<H: TabHost> MessageSink for TabSink<H> {
    async fn handle(&self, message: &NotificationMessage) -> Result<(), SinkError> {
        let Some(presentation) = Presentation::classify(message) else {
            return Ok(());
        };
        self.open_in_group(&presentation.tab_url(), presentation.topic())
            .await
    }
}
