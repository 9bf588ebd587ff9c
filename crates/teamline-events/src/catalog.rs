//! # Event Catalog
//!
//! The integration events Teamline services publish. Each variant is an
//! immutable value object: a fixed set of payload fields plus the
//! [`IntegrationEvent`] descriptor naming it and fixing its routing key.
//!
//! Grouped by producing service.

use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::envelope::IntegrationEvent;

// =============================================================================
// CHAT SERVICE
// =============================================================================

/// A chat message was sent to a team channel.
///
/// Consumed by the notification service to fan out unread-message
/// notifications to every recipient.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ChatMessageSent {
    /// The message's identifier.
    pub message_id: Uuid,
    /// Team the message was posted in.
    pub team_id: Uuid,
    /// Author of the message.
    pub sender_id: Uuid,
    /// Members the message is addressed to.
    pub recipient_ids: Vec<Uuid>,
    /// Short body preview for notification text.
    pub preview: String,
}

impl IntegrationEvent for ChatMessageSent {
    const NAME: &'static str = "ChatMessageSent";
    const ROUTING_KEY: &'static str = "chat.message.sent";
}

// =============================================================================
// DOCUMENT SERVICE
// =============================================================================

/// A document was uploaded to a team workspace.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DocumentUploaded {
    /// The document's identifier.
    pub document_id: Uuid,
    /// Team workspace the document belongs to.
    pub team_id: Uuid,
    /// Member who uploaded it.
    pub uploader_id: Uuid,
    /// Original file name.
    pub file_name: String,
    /// File size in bytes.
    pub size_bytes: u64,
}

impl IntegrationEvent for DocumentUploaded {
    const NAME: &'static str = "DocumentUploaded";
    const ROUTING_KEY: &'static str = "documents.file.uploaded";
}

// =============================================================================
// ACCOUNT SERVICE
// =============================================================================

/// A new user completed registration.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct UserRegistered {
    /// The user's identifier.
    pub user_id: Uuid,
    /// Display name chosen at registration.
    pub display_name: String,
    /// Verified e-mail address.
    pub email: String,
}

impl IntegrationEvent for UserRegistered {
    const NAME: &'static str = "UserRegistered";
    const ROUTING_KEY: &'static str = "accounts.user.registered";
}

// =============================================================================
// TASK SERVICE
// =============================================================================

/// A task was assigned to a team member.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TaskAssigned {
    /// The task's identifier.
    pub task_id: Uuid,
    /// Team the task belongs to.
    pub team_id: Uuid,
    /// Member the task was assigned to.
    pub assignee_id: Uuid,
    /// Member who made the assignment.
    pub assigner_id: Uuid,
}

impl IntegrationEvent for TaskAssigned {
    const NAME: &'static str = "TaskAssigned";
    const ROUTING_KEY: &'static str = "tasks.task.assigned";
}

// =============================================================================
// MILESTONE SERVICE
// =============================================================================

/// A project checkpoint was marked completed.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CheckpointCompleted {
    /// The checkpoint's identifier.
    pub checkpoint_id: Uuid,
    /// Team the checkpoint belongs to.
    pub team_id: Uuid,
    /// Member who completed it.
    pub completed_by: Uuid,
}

impl IntegrationEvent for CheckpointCompleted {
    const NAME: &'static str = "CheckpointCompleted";
    const ROUTING_KEY: &'static str = "milestones.checkpoint.completed";
}

// =============================================================================
// NOTIFICATION SERVICE
// =============================================================================

/// A notification was handed to the delivery pipeline.
///
/// Uses the lowercased-name default routing key; there is no hierarchical
/// topology downstream of the notification fan-out.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct NotificationDispatched {
    /// The notification's identifier.
    pub notification_id: Uuid,
    /// Member the notification is for.
    pub recipient_id: Uuid,
    /// Notification kind (e.g. `"mention"`, `"assignment"`).
    pub kind: String,
}

impl IntegrationEvent for NotificationDispatched {
    const NAME: &'static str = "NotificationDispatched";
    const ROUTING_KEY: &'static str = "notificationdispatched";
}
