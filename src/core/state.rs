//! 轮次状态机
//!
//! AwaitingUser -> Routing -> (Executing | Terminated)；Executing -> Routing 回环；Terminated 对本轮为终态。
//! TurnMachine 只负责合法迁移与往返计数，不做任何 I/O；Orchestrator 在每个动作前后推进它。

use serde::Serialize;

use crate::core::OrchestrationError;

/// 单个用户轮次所处的阶段
#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
#[serde(tag = "phase", rename_all = "snake_case")]
pub enum TurnPhase {
    AwaitingUser,
    Routing,
    Executing { handler: String },
    Terminated,
}

impl TurnPhase {
    pub fn name(&self) -> &'static str {
        match self {
            TurnPhase::AwaitingUser => "awaiting_user",
            TurnPhase::Routing => "routing",
            TurnPhase::Executing { .. } => "executing",
            TurnPhase::Terminated => "terminated",
        }
    }

    /// 迁移表
    pub fn can_transition_to(&self, next: &TurnPhase) -> bool {
        matches!(
            (self, next),
            (TurnPhase::AwaitingUser, TurnPhase::Routing)
                | (TurnPhase::Routing, TurnPhase::Executing { .. })
                | (TurnPhase::Routing, TurnPhase::Terminated)
                | (TurnPhase::Executing { .. }, TurnPhase::Routing)
        )
    }
}

/// 一个轮次的状态机：当前阶段 + Routing→Executing 往返次数
#[derive(Clone, Debug)]
pub struct TurnMachine {
    phase: TurnPhase,
    round_trips: usize,
    max_round_trips: usize,
}

impl TurnMachine {
    pub fn new(max_round_trips: usize) -> Self {
        Self {
            phase: TurnPhase::AwaitingUser,
            round_trips: 0,
            max_round_trips,
        }
    }

    /// 续跑一个未完成的轮次：已完成的往返计入上限
    pub fn resume(max_round_trips: usize, completed_round_trips: usize) -> Self {
        Self {
            round_trips: completed_round_trips,
            ..Self::new(max_round_trips)
        }
    }

    pub fn phase(&self) -> &TurnPhase {
        &self.phase
    }

    pub fn round_trips(&self) -> usize {
        self.round_trips
    }

    pub fn max_round_trips(&self) -> usize {
        self.max_round_trips
    }

    /// 是否已用完本轮往返上限（此时只能强制终止）
    pub fn ceiling_reached(&self) -> bool {
        self.round_trips >= self.max_round_trips
    }

    /// 推进到下一阶段；非法迁移返回 InvalidState
    pub fn advance(&mut self, next: TurnPhase) -> Result<(), OrchestrationError> {
        if !self.phase.can_transition_to(&next) {
            return Err(OrchestrationError::InvalidState(format!(
                "illegal turn transition {} -> {}",
                self.phase.name(),
                next.name()
            )));
        }
        if matches!(next, TurnPhase::Executing { .. }) {
            if self.ceiling_reached() {
                return Err(OrchestrationError::BudgetExceeded(format!(
                    "round-trip ceiling of {} reached",
                    self.max_round_trips
                )));
            }
            self.round_trips += 1;
        }
        self.phase = next;
        Ok(())
    }

    pub fn is_terminated(&self) -> bool {
        self.phase == TurnPhase::Terminated
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn exec(h: &str) -> TurnPhase {
        TurnPhase::Executing {
            handler: h.to_string(),
        }
    }

    #[test]
    fn test_legal_loop() {
        let mut m = TurnMachine::new(5);
        m.advance(TurnPhase::Routing).unwrap();
        m.advance(exec("knowledge_handler")).unwrap();
        m.advance(TurnPhase::Routing).unwrap();
        m.advance(TurnPhase::Terminated).unwrap();
        assert!(m.is_terminated());
        assert_eq!(m.round_trips(), 1);
    }

    #[test]
    fn test_illegal_transitions() {
        let mut m = TurnMachine::new(5);
        assert!(m.advance(exec("h")).is_err());
        assert!(m.advance(TurnPhase::Terminated).is_err());
        m.advance(TurnPhase::Routing).unwrap();
        m.advance(TurnPhase::Terminated).unwrap();
        assert!(m.advance(TurnPhase::Routing).is_err());
        assert_eq!(m.phase(), &TurnPhase::Terminated);
    }

    #[test]
    fn test_resume_counts_completed_round_trips() {
        let mut m = TurnMachine::resume(2, 1);
        assert_eq!(m.phase(), &TurnPhase::AwaitingUser);
        m.advance(TurnPhase::Routing).unwrap();
        m.advance(exec("knowledge_handler")).unwrap();
        assert!(m.ceiling_reached());
    }

    #[test]
    fn test_ceiling_blocks_execution() {
        let mut m = TurnMachine::new(2);
        m.advance(TurnPhase::Routing).unwrap();
        for _ in 0..2 {
            m.advance(exec("h")).unwrap();
            m.advance(TurnPhase::Routing).unwrap();
        }
        assert!(m.ceiling_reached());
        assert!(matches!(
            m.advance(exec("h")),
            Err(OrchestrationError::BudgetExceeded(_))
        ));
        m.advance(TurnPhase::Terminated).unwrap();
        assert_eq!(m.round_trips(), 2);
    }

    #[test]
    fn test_phase_serializes_tagged() {
        let v = serde_json::to_value(exec("library_handler")).unwrap();
        assert_eq!(v["phase"], "executing");
        assert_eq!(v["handler"], "library_handler");
    }
}
