//! 频道传输层抽象
//!
//! 传输层由外部提供（WebSocket、长连接推送等），这里只描述同步层
//! 依赖的最小接口：按主题打开连接、收到有序的状态/消息流、关闭连接。

use async_trait::async_trait;
use serde_json::Value;
use tokio::sync::mpsc;

use crate::error::Result;
use crate::topic::Topic;

/// 传输连接ID，由传输层分配
pub type ConnectionId = u64;

/// 传输层报告的状态
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TransportStatus {
    /// 订阅握手完成
    Subscribed,
    /// 连接出错
    Error(String),
    /// 握手或心跳超时
    TimedOut,
    /// 传输层主动关闭
    Closed,
}

/// 传输层按到达顺序投递的事件
#[derive(Debug, Clone, PartialEq)]
pub enum TransportEvent {
    Status(TransportStatus),
    Message(Value),
}

/// 一个已打开的主题连接
#[derive(Debug)]
pub struct TransportConnection {
    pub id: ConnectionId,
    /// 有序事件流，发送端关闭视为连接异常结束
    pub events: mpsc::UnboundedReceiver<TransportEvent>,
}

/// 频道传输层
#[async_trait]
pub trait ChannelTransport: Send + Sync {
    /// 打开主题连接
    async fn open(&self, topic: &Topic) -> Result<TransportConnection>;

    /// 关闭连接（同一连接只会被调用一次）
    async fn close(&self, connection: ConnectionId);
}
