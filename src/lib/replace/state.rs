use std::collections::HashMap;

use super::types::ReplacementState;

pub fn valid_state_transition(src: &ReplacementState, dst: &ReplacementState) -> bool {
    let state_transition_map: HashMap<ReplacementState, Vec<ReplacementState>> = {
        let mut map = HashMap::new();
        map.insert(
            ReplacementState::Stopping,
            vec![ReplacementState::ConfigCaptured, ReplacementState::Failed],
        );
        map.insert(
            ReplacementState::ConfigCaptured,
            vec![ReplacementState::BackedUp, ReplacementState::Failed],
        );
        map.insert(
            ReplacementState::BackedUp,
            vec![ReplacementState::Creating, ReplacementState::RollingBack],
        );
        map.insert(
            ReplacementState::Creating,
            vec![ReplacementState::Validating, ReplacementState::RollingBack],
        );
        map.insert(
            ReplacementState::Validating,
            vec![ReplacementState::Committed, ReplacementState::RollingBack],
        );
        map.insert(ReplacementState::RollingBack, vec![ReplacementState::Failed]);
        map.insert(ReplacementState::Committed, vec![]);
        map.insert(ReplacementState::Failed, vec![]);
        map
    };

    if let Some(valid_states) = state_transition_map.get(src) {
        valid_states.contains(dst)
    } else {
        false
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use ReplacementState::*;

    #[test]
    fn forward_path_is_legal() {
        let path = [Stopping, ConfigCaptured, BackedUp, Creating, Validating, Committed];
        assert!(path.windows(2).all(|w| valid_state_transition(&w[0], &w[1])));
    }

    #[test]
    fn rollback_only_after_backup() {
        assert!(!valid_state_transition(&ConfigCaptured, &RollingBack));
        assert!(valid_state_transition(&Creating, &RollingBack));
        assert!(valid_state_transition(&RollingBack, &Failed));
        assert!(!valid_state_transition(&Creating, &Failed));
    }

    #[test]
    fn terminal_states_and_backwards_moves_are_rejected() {
        assert!(!valid_state_transition(&Committed, &Stopping));
        assert!(!valid_state_transition(&Failed, &RollingBack));
        assert!(!valid_state_transition(&Validating, &Creating));
    }
}
