//! 写入授权：按 (实体角色, 来源) 查表决定是否允许修改
//!
//! 身份实体只接受用户本人或系统写入；其余实体任何来源都可写。

use crate::memory::entity::{EntityNode, EntitySource};

/// 实体在授权表中的角色
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum EntityRole {
    /// 用户身份实体（user:self）
    Identity,
    General,
}

impl EntityRole {
    pub fn of(entity: &EntityNode) -> Self {
        if entity.is_user() {
            EntityRole::Identity
        } else {
            EntityRole::General
        }
    }
}

/// (角色, 来源) -> 是否允许
const CAPABILITIES: &[(EntityRole, EntitySource, bool)] = &[
    (EntityRole::Identity, EntitySource::UserStated, true),
    (EntityRole::Identity, EntitySource::UserConfirmed, true),
    (EntityRole::Identity, EntitySource::System, true),
    (EntityRole::Identity, EntitySource::ToolResult, false),
    (EntityRole::Identity, EntitySource::LlmInferred, false),
    (EntityRole::Identity, EntitySource::MemoryRecalled, false),
    (EntityRole::General, EntitySource::UserStated, true),
    (EntityRole::General, EntitySource::UserConfirmed, true),
    (EntityRole::General, EntitySource::System, true),
    (EntityRole::General, EntitySource::ToolResult, true),
    (EntityRole::General, EntitySource::LlmInferred, true),
    (EntityRole::General, EntitySource::MemoryRecalled, true),
];

/// 表中没有的组合一律拒绝
pub fn is_write_allowed(role: EntityRole, source: EntitySource) -> bool {
    CAPABILITIES
        .iter()
        .find(|(r, s, _)| *r == role && *s == source)
        .map(|(_, _, allowed)| *allowed)
        .unwrap_or(false)
}

pub fn can_write(entity: &EntityNode, source: EntitySource) -> bool {
    is_write_allowed(EntityRole::of(entity), source)
}
