//! 认知层：计划结构与规划器接口、结果校验、回合管线

pub mod events;
pub mod planner;
pub mod turn;
pub mod verifier;

pub use events::TurnEvent;
pub use planner::{parse_plan, LlmPlanner, Plan, PlanRequest, PlanStep, Planner};
pub use turn::{TurnOutcome, TurnPipeline, TurnStatus};
pub use verifier::{heuristic_verdict, parse_verdict, ParsedVerdict, Verdict, Verifier};
