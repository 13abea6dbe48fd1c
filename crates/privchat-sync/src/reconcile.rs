//! 远端变更与本地乐观状态的合并
//!
//! [`reconcile`] 是 (未决编辑, 输入事件) 上的纯函数（已确认值在有未决编辑时
//! 总等于其回滚目标），
//! 只给出决策，由 [`OptimisticStateStore`](crate::optimistic::OptimisticStateStore) 执行。
//! 冲突策略：最后确认的写入获胜，乐观值不会比与之冲突的确认值活得更久。

use crate::optimistic::{MutationId, OptimisticEdit};

/// 输入事件
#[derive(Debug, Clone, PartialEq)]
pub enum ReconcileEvent<V> {
    /// 频道回显（本会话或其他会话的写入）
    RemoteEcho(V),
    /// 持久化成功
    PersistSucceeded(MutationId),
    /// 持久化显式失败
    PersistFailed { mutation_id: MutationId, reason: String },
    /// 看门狗超时
    WatchdogExpired(MutationId),
}

/// 合并决策
#[derive(Debug, Clone, PartialEq)]
pub enum Decision<V> {
    /// 没有未决编辑，直接采用远端值
    Adopt(V),
    /// 未决编辑被确认，可见值不变
    Resolve { mutation_id: MutationId },
    /// 被取代的写入得到确认：推进回滚目标，保留当前编辑
    AdvanceRollback { value: V, superseded: MutationId },
    /// 远端值与乐观值冲突，远端获胜
    RemoteWins { value: V, discarded: MutationId },
    /// 回滚到回滚目标并标记失败
    Revert {
        mutation_id: MutationId,
        to: Option<V>,
        reason: String,
    },
    /// 与当前状态无关的事件
    Ignore,
}

/// 合并一条事件
pub fn reconcile<V>(edit: Option<&OptimisticEdit<V>>, event: ReconcileEvent<V>) -> Decision<V>
where
    V: Clone + PartialEq,
{
    match (edit, event) {
        (None, ReconcileEvent::RemoteEcho(value)) => Decision::Adopt(value),
        (None, _) => Decision::Ignore,

        (Some(edit), ReconcileEvent::RemoteEcho(value)) => {
            if value == edit.proposed {
                return Decision::Resolve {
                    mutation_id: edit.mutation_id.clone(),
                };
            }
            // 本会话被取代写入的迟到回显
            if let Some((superseded, _)) = edit.superseded.iter().find(|(_, v)| *v == value) {
                return Decision::AdvanceRollback {
                    value,
                    superseded: superseded.clone(),
                };
            }
            Decision::RemoteWins {
                value,
                discarded: edit.mutation_id.clone(),
            }
        }

        (Some(edit), ReconcileEvent::PersistSucceeded(mutation_id)) => {
            if mutation_id == edit.mutation_id {
                return Decision::Resolve { mutation_id };
            }
            match edit.superseded.iter().find(|(id, _)| *id == mutation_id) {
                Some((_, value)) => Decision::AdvanceRollback {
                    value: value.clone(),
                    superseded: mutation_id,
                },
                None => Decision::Ignore,
            }
        }

        (Some(edit), ReconcileEvent::PersistFailed { mutation_id, reason }) => {
            // 被取代写入的失败由最新的编辑决定结局
            if mutation_id != edit.mutation_id {
                return Decision::Ignore;
            }
            Decision::Revert {
                mutation_id,
                to: edit.rollback_target.clone(),
                reason,
            }
        }

        (Some(edit), ReconcileEvent::WatchdogExpired(mutation_id)) => {
            if mutation_id != edit.mutation_id {
                return Decision::Ignore;
            }
            Decision::Revert {
                mutation_id,
                to: edit.rollback_target.clone(),
                reason: "watchdog timeout".to_string(),
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;

    fn edit(proposed: &'static str, rollback: &'static str) -> OptimisticEdit<&'static str> {
        OptimisticEdit {
            mutation_id: "m2".to_string(),
            rollback_target: Some(rollback),
            proposed,
            issued_at: Utc::now(),
            scope: None,
            superseded: vec![("m1".to_string(), "system")],
        }
    }

    #[test]
    fn test_echo_without_pending_edit_is_adopted() {
        assert_eq!(reconcile(None, ReconcileEvent::RemoteEcho("dark")), Decision::Adopt("dark"));
        assert_eq!(
            reconcile::<&str>(None, ReconcileEvent::PersistSucceeded("m1".into())),
            Decision::Ignore
        );
    }

    #[test]
    fn test_matching_echo_resolves() {
        let pending = edit("dark", "light");
        assert_eq!(
            reconcile(Some(&pending), ReconcileEvent::RemoteEcho("dark")),
            Decision::Resolve {
                mutation_id: "m2".into()
            }
        );
    }

    #[test]
    fn test_conflicting_echo_remote_wins() {
        let pending = edit("dark", "light");
        assert_eq!(
            reconcile(Some(&pending), ReconcileEvent::RemoteEcho("light")),
            Decision::RemoteWins {
                value: "light",
                discarded: "m2".into()
            }
        );
    }

    #[test]
    fn test_superseded_echo_and_success_advance_rollback() {
        let pending = edit("dark", "light");
        assert_eq!(
            reconcile(Some(&pending), ReconcileEvent::RemoteEcho("system")),
            Decision::AdvanceRollback {
                value: "system",
                superseded: "m1".into()
            }
        );
        assert_eq!(
            reconcile(Some(&pending), ReconcileEvent::PersistSucceeded("m1".into())),
            Decision::AdvanceRollback {
                value: "system",
                superseded: "m1".into()
            }
        );
    }

    #[test]
    fn test_failure_and_watchdog_revert_current_edit_only() {
        let pending = edit("dark", "light");
        assert_eq!(
            reconcile(
                Some(&pending),
                ReconcileEvent::PersistFailed {
                    mutation_id: "m1".into(),
                    reason: "boom".into()
                }
            ),
            Decision::Ignore
        );
        assert_eq!(
            reconcile(Some(&pending), ReconcileEvent::WatchdogExpired("m2".into())),
            Decision::Revert {
                mutation_id: "m2".into(),
                to: Some("light"),
                reason: "watchdog timeout".into()
            }
        );
    }
}
