//! 记忆层：世界记忆图（实体 + 动作）、写入授权、指代消解与持久化

pub mod action;
pub mod authz;
pub mod entity;
pub mod graph;
pub mod persistence;
pub mod resolver;
pub mod shared;

pub use action::ActionNode;
pub use authz::EntityRole;
pub use entity::{Attributes, EntityLifecycle, EntityNode, EntitySource, EntityType, USER_ID};
pub use graph::{GraphStats, MaintenanceReport, MemoryGraph, MemoryPolicy};
pub use persistence::{GraphDocument, GraphStore};
pub use resolver::{ActionTag, PlanRejection, Resolution, Resolved};
pub use shared::SharedGraph;
