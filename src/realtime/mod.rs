//! 核心事件总线
//! 通知 / UI 层订阅的纯数据事件

use chrono::{DateTime, Utc};
use serde::Serialize;
use tokio::sync::broadcast;
use uuid::Uuid;

use crate::models::workflow::WorkflowState;

/// 核心事件类型
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "type", content = "data", rename_all = "snake_case")]
pub enum CoreEvent {
    /// 演示模式切换
    DemoModeChanged { enabled: bool, changed_by: Uuid },
    /// 会话即将过期
    SessionExpiring {
        session_id: String,
        user_id: Uuid,
        expires_at: DateTime<Utc>,
        remaining_secs: i64,
    },
    /// 病例状态迁移完成
    WorkflowTransitioned {
        case_id: String,
        from: WorkflowState,
        to: WorkflowState,
        user_id: Uuid,
    },
}

impl CoreEvent {
    /// 获取事件类型名称
    pub fn event_type(&self) -> &'static str {
        match self {
            CoreEvent::DemoModeChanged { .. } => "demo_mode_changed",
            CoreEvent::SessionExpiring { .. } => "session_expiring",
            CoreEvent::WorkflowTransitioned { .. } => "workflow_transitioned",
        }
    }

    /// 事件关联的用户
    pub fn user_id(&self) -> Uuid {
        match self {
            CoreEvent::DemoModeChanged { changed_by, .. } => *changed_by,
            CoreEvent::SessionExpiring { user_id, .. } => *user_id,
            CoreEvent::WorkflowTransitioned { user_id, .. } => *user_id,
        }
    }

    /// JSON 表示，供 IPC 层直接转发
    pub fn to_json(&self) -> String {
        serde_json::to_string(self).unwrap_or_default()
    }
}

/// 事件总线
#[derive(Clone)]
pub struct EventBus {
    sender: broadcast::Sender<CoreEvent>,
}

impl EventBus {
    /// 创建新的事件总线
    pub fn new(capacity: usize) -> Self {
        let (sender, _) = broadcast::channel(capacity);
        Self { sender }
    }

    /// 发布事件，返回接收者数量；无人订阅时事件被丢弃
    pub fn publish(&self, event: CoreEvent) -> usize {
        let event_type = event.event_type();
        match self.sender.send(event) {
            Ok(receivers) => receivers,
            Err(_) => {
                tracing::trace!(event_type, "No subscribers for event");
                0
            }
        }
    }

    /// 订阅所有事件
    pub fn subscribe(&self) -> broadcast::Receiver<CoreEvent> {
        self.sender.subscribe()
    }

    /// 只订阅某个用户相关的事件
    pub fn subscribe_for_user(&self, user_id: Uuid) -> UserEventStream {
        UserEventStream {
            receiver: self.subscribe(),
            user_id,
        }
    }
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new(256)
    }
}

/// 按用户过滤的事件流
pub struct UserEventStream {
    receiver: broadcast::Receiver<CoreEvent>,
    user_id: Uuid,
}

impl UserEventStream {
    /// 下一条属于该用户的事件；总线关闭时返回 None
    pub async fn recv(&mut self) -> Option<CoreEvent> {
        loop {
            match self.receiver.recv().await {
                Ok(event) if event.user_id() == self.user_id => return Some(event),
                Ok(_) => continue,
                Err(broadcast::error::RecvError::Lagged(skipped)) => {
                    tracing::warn!(skipped, "Event stream lagged");
                    continue;
                }
                Err(broadcast::error::RecvError::Closed) => return None,
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_publish_without_subscribers_does_not_fail() {
        let bus = EventBus::new(8);
        let delivered = bus.publish(CoreEvent::DemoModeChanged {
            enabled: true,
            changed_by: Uuid::new_v4(),
        });
        assert_eq!(delivered, 0);
    }

    #[tokio::test]
    async fn test_subscriber_receives_event() {
        let bus = EventBus::new(8);
        let mut rx = bus.subscribe();
        let user_id = Uuid::new_v4();

        assert_eq!(
            bus.publish(CoreEvent::DemoModeChanged {
                enabled: false,
                changed_by: user_id,
            }),
            1
        );

        let event = rx.recv().await.unwrap();
        assert_eq!(event.event_type(), "demo_mode_changed");
        assert_eq!(event.user_id(), user_id);
    }

    #[tokio::test]
    async fn test_user_stream_filters_other_users() {
        let bus = EventBus::new(8);
        let alice = Uuid::new_v4();
        let bob = Uuid::new_v4();
        let mut stream = bus.subscribe_for_user(alice);

        bus.publish(CoreEvent::DemoModeChanged {
            enabled: true,
            changed_by: bob,
        });
        bus.publish(CoreEvent::WorkflowTransitioned {
            case_id: "CASE-1".to_string(),
            from: WorkflowState::Draft,
            to: WorkflowState::DataEntryComplete,
            user_id: alice,
        });

        let event = stream.recv().await.unwrap();
        assert!(matches!(event, CoreEvent::WorkflowTransitioned { .. }));
    }

    #[test]
    fn test_event_json_shape() {
        let json: serde_json::Value = serde_json::from_str(
            &CoreEvent::WorkflowTransitioned {
                case_id: "CASE-9".to_string(),
                from: WorkflowState::InQcReview,
                to: WorkflowState::QcComplete,
                user_id: Uuid::nil(),
            }
            .to_json(),
        )
        .unwrap();

        assert_eq!(json["type"], "workflow_transitioned");
        assert_eq!(json["data"]["from"], "In QC Review");
        assert_eq!(json["data"]["to"], "QC Complete");
    }
}
