use tether_gateway::UserId;

/// Counter bumped on every peer change.
///
/// A fetch issued under an older generation is stale and must not touch the ledger.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Default)]
pub struct SwitchGeneration(pub u64);

impl SwitchGeneration {
    pub const fn new(raw: u64) -> Self {
        Self(raw)
    }

    fn next(self) -> Self {
        Self(self.0.wrapping_add(1))
    }
}

/// Routing key captured when an async operation starts, used to reject stale completions.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct SwitchTicket {
    pub peer: UserId,
    pub generation: SwitchGeneration,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Selection {
    Unchanged,
    Changed {
        previous: Option<UserId>,
        current: Option<UserId>,
        generation: SwitchGeneration,
    },
}

/// Holds the active peer. Side effects of a change belong to the session.
#[derive(Debug, Default)]
pub struct ConversationSelector {
    selected: Option<UserId>,
    generation: SwitchGeneration,
}

impl ConversationSelector {
    pub fn selected(&self) -> Option<&UserId> {
        self.selected.as_ref()
    }

    pub fn generation(&self) -> SwitchGeneration {
        self.generation
    }

    pub fn select(&mut self, peer: Option<UserId>) -> Selection {
        if self.selected == peer {
            return Selection::Unchanged;
        }

        self.generation = self.generation.next();
        let previous = std::mem::replace(&mut self.selected, peer);
        Selection::Changed {
            previous,
            current: self.selected.clone(),
            generation: self.generation,
        }
    }

    pub fn ticket_for_current(&self) -> Option<SwitchTicket> {
        self.selected.as_ref().map(|peer| SwitchTicket {
            peer: peer.clone(),
            generation: self.generation,
        })
    }

    pub fn is_current(&self, ticket: &SwitchTicket) -> bool {
        self.generation == ticket.generation && self.selected.as_ref() == Some(&ticket.peer)
    }
}
