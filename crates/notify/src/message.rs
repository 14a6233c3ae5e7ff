//! Builds Discord messages for detected changes.
//!
//! Three message kinds exist: a broadcast item (webhook, no mention), a
//! targeted item and a targeted relationship edge (bot channel, mentioning
//! the observer). All text goes through minijinja templates; the defaults
//! below can be replaced field by field.

use std::sync::Arc;

use serde::Serialize;

use feedwatch_core::{AccountInfo, Entity, Item};

use crate::templating::TemplateRenderer;
use crate::traits::{Embed, Notification, NotifyError};

pub const ITEM_COLOR: u32 = 0x1DA1F2;
pub const RELATIONSHIP_COLOR: u32 = 0x00FF00;

pub fn item_url(username: &str, item_id: &str) -> String {
    format!("https://x.com/{username}/status/{item_id}")
}

pub fn profile_url(username: &str) -> String {
    format!("https://x.com/{username}")
}

/// Template sources, one per rendered string.
#[derive(Debug, Clone)]
pub struct MessageTemplates {
    pub item_title: String,
    pub item_engagement: String,
    pub item_footer: String,
    pub targeted_item_title: String,
    pub targeted_item_content: String,
    pub relationship_title: String,
    pub relationship_description: String,
    pub relationship_content: String,
    pub targeted_footer: String,
}

impl Default for MessageTemplates {
    fn default() -> Self {
        Self {
            item_title: "New post from {{ account.name }} (@{{ account.username }})".into(),
            item_engagement: "💬 {{ item.metrics.reply_count | compact }} | \
                              🔁 {{ item.metrics.repost_count | compact }} | \
                              ❤️ {{ item.metrics.like_count | compact }}"
                .into(),
            item_footer: "Posted at {% if item.created_at %}{{ item.created_at }}\
                          {% else %}unknown{% endif %}"
                .into(),
            targeted_item_title: "🔔 New post: {{ account.name }} (@{{ account.username }})".into(),
            targeted_item_content: "<@{{ observer }}> an account you follow just posted!".into(),
            relationship_title: "➕ New follow: {{ account.name }} (@{{ account.username }})".into(),
            relationship_description: "Just followed **{{ entity.name }} (@{{ entity.username }})**\n\n\
                                       **Bio**:\n{% if entity.description %}{{ entity.description }}\
                                       {% else %}none{% endif %}"
                .into(),
            relationship_content: "<@{{ observer }}> an account you watch followed someone new!".into(),
            targeted_footer: "Time: {{ now }}".into(),
        }
    }
}

impl MessageTemplates {
    fn all(&self) -> [&str; 9] {
        [
            self.item_title.as_str(),
            self.item_engagement.as_str(),
            self.item_footer.as_str(),
            self.targeted_item_title.as_str(),
            self.targeted_item_content.as_str(),
            self.relationship_title.as_str(),
            self.relationship_description.as_str(),
            self.relationship_content.as_str(),
            self.targeted_footer.as_str(),
        ]
    }
}

#[derive(Serialize)]
struct MessageContext<'a> {
    account: &'a AccountInfo,
    #[serde(skip_serializing_if = "Option::is_none")]
    item: Option<&'a Item>,
    #[serde(skip_serializing_if = "Option::is_none")]
    entity: Option<&'a Entity>,
    #[serde(skip_serializing_if = "Option::is_none")]
    observer: Option<&'a str>,
    now: String,
}

/// Renders [`Notification`]s from domain objects.
#[derive(Debug, Clone)]
pub struct MessageBuilder {
    renderer: Arc<TemplateRenderer>,
    templates: MessageTemplates,
}

impl Default for MessageBuilder {
    fn default() -> Self {
        Self {
            renderer: Arc::new(TemplateRenderer::new()),
            templates: MessageTemplates::default(),
        }
    }
}

impl MessageBuilder {
    /// Builder with custom templates. Every template is syntax-checked.
    pub fn with_templates(
        renderer: Arc<TemplateRenderer>,
        templates: MessageTemplates,
    ) -> Result<Self, NotifyError> {
        for source in templates.all() {
            renderer
                .validate(source)
                .map_err(|e| NotifyError::Config(format!("invalid message template: {e}")))?;
        }
        Ok(Self {
            renderer,
            templates,
        })
    }

    fn now() -> String {
        chrono::Local::now().format("%Y-%m-%d %H:%M:%S").to_string()
    }

    fn render(&self, template: &str, ctx: &MessageContext<'_>) -> Result<String, NotifyError> {
        self.renderer.render(template, ctx)
    }

    /// Webhook embed for a new item. No mention.
    pub fn broadcast_item(&self, account: &AccountInfo, item: &Item) -> Result<Notification, NotifyError> {
        let ctx = MessageContext {
            account,
            item: Some(item),
            entity: None,
            observer: None,
            now: Self::now(),
        };
        let t = &self.templates;
        let embed = Embed::new(&self.render(&t.item_title, &ctx)?, ITEM_COLOR)
            .description(&item.text)
            .url(item_url(&account.username, &item.id))
            .field("Engagement", &self.render(&t.item_engagement, &ctx)?, true)
            .footer(self.render(&t.item_footer, &ctx)?);
        Ok(Notification::embed(embed))
    }

    /// Bot-channel message telling `observer` about a new item.
    pub fn targeted_item(
        &self,
        observer: &str,
        account: &AccountInfo,
        item: &Item,
    ) -> Result<Notification, NotifyError> {
        let ctx = MessageContext {
            account,
            item: Some(item),
            entity: None,
            observer: Some(observer),
            now: Self::now(),
        };
        let t = &self.templates;
        let embed = Embed::new(&self.render(&t.targeted_item_title, &ctx)?, ITEM_COLOR)
            .description(&item.text)
            .url(item_url(&account.username, &item.id))
            .footer(self.render(&t.targeted_footer, &ctx)?);
        Ok(Notification::embed(embed).with_content(self.render(&t.targeted_item_content, &ctx)?))
    }

    /// Bot-channel message telling `observer` that `account` gained an edge to `entity`.
    pub fn targeted_relationship(
        &self,
        observer: &str,
        account: &AccountInfo,
        entity: &Entity,
    ) -> Result<Notification, NotifyError> {
        let ctx = MessageContext {
            account,
            item: None,
            entity: Some(entity),
            observer: Some(observer),
            now: Self::now(),
        };
        let t = &self.templates;
        let embed = Embed::new(&self.render(&t.relationship_title, &ctx)?, RELATIONSHIP_COLOR)
            .description(&self.render(&t.relationship_description, &ctx)?)
            .url(profile_url(&entity.username))
            .footer(self.render(&t.targeted_footer, &ctx)?);
        Ok(Notification::embed(embed).with_content(self.render(&t.relationship_content, &ctx)?))
    }
}
