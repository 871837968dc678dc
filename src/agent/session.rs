use chrono::{DateTime, Utc};
use tracing::info;
use uuid::Uuid;

use super::memory::ConversationMemory;
use super::state::UserContext;

/// One authenticated conversation: who is asking plus what they asked before.
#[derive(Debug)]
pub struct Session {
    pub id: Uuid,
    pub user: UserContext,
    pub memory: ConversationMemory,
    pub created_at: DateTime<Utc>,
    pub last_active: DateTime<Utc>,
}

impl Session {
    pub fn new(user: UserContext, max_history: usize) -> Self {
        let now = Utc::now();
        Self {
            id: Uuid::new_v4(),
            user,
            memory: ConversationMemory::new(max_history),
            created_at: now,
            last_active: now,
        }
    }

    pub fn touch(&mut self) {
        self.last_active = Utc::now();
    }

    /// Forgets the conversation but keeps the identity.
    pub fn reset(&mut self) {
        self.memory.clear();
        self.touch();
        info!("Session {} reset", self.id);
    }

    /// Swaps in a newly authenticated identity. Memory never carries across roles.
    pub fn change_role(&mut self, user: UserContext) {
        info!("Session {} switching role from {} to {}", self.id, self.user.role, user.role);
        self.user = user;
        self.memory.clear();
        self.touch();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::agent::memory::ConversationTurn;
    use crate::agent::state::Role;

    #[test]
    fn role_change_clears_memory() {
        let mut session = Session::new(UserContext::new(Role::Owner, Some(2)).unwrap(), 10);
        session
            .memory
            .record(ConversationTurn::new("How many properties does LLC2 have?", None, None, "12"));
        assert_eq!(session.memory.len(), 1);

        session.change_role(UserContext::new(Role::Viewer, None).unwrap());
        assert_eq!(session.user.role, Role::Viewer);
        assert!(session.memory.is_empty());
        assert!(session.memory.current_context().is_empty());
    }

    #[test]
    fn reset_keeps_identity() {
        let mut session = Session::new(UserContext::new(Role::Admin, None).unwrap(), 3);
        session.memory.record(ConversationTurn::new("How many units?", None, None, "166"));
        session.reset();
        assert!(session.memory.is_empty());
        assert_eq!(session.user.role, Role::Admin);
    }
}
