//! 轮次过程事件：用于流式展示路由、动作调用、观察与结束

use serde::Serialize;

/// 单步过程事件（可序列化为 JSON 供前端展示）
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum TurnEvent {
    TurnStarted { thread_id: String },
    /// Router 的决策（handler 名称或 FINISH）
    Routed { next: String, round_trip: usize },
    /// 路由输出无法解析，带纠正提示重试一次
    RoutingRetry { reason: String },
    /// 重试仍失败，回退为 FINISH + 致歉
    RoutingFallback { reason: String },
    /// handler 请求调用一个动作
    ActionRequested {
        handler: String,
        action: String,
        arguments: serde_json::Value,
    },
    /// 能力返回（预览，避免过长）
    Observation {
        handler: String,
        action: String,
        preview: String,
    },
    HandlerFinished {
        handler: String,
        succeeded: bool,
        cycles: usize,
    },
    /// 达到往返上限，强制终止
    CeilingReached { round_trips: usize },
    TurnFinished { thread_id: String, round_trips: usize },
}

pub type EventSender = tokio::sync::mpsc::UnboundedSender<TurnEvent>;

pub(crate) fn send_event(tx: Option<&EventSender>, ev: TurnEvent) {
    if let Some(t) = tx {
        let _ = t.send(ev);
    }
}
