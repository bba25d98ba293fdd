use rand::Rng;
use std::sync::{LazyLock, Mutex};

const ID_CHARS: &[u8; 64] = b"-0123456789ABCDEFGHIJKLMNOPQRSTUVWXYZ_abcdefghijklmnopqrstuvwxyz";

struct IdState {
    last_time: u64,
    last_rand_chars: [u8; 12],
}

impl IdState {
    const fn new() -> Self {
        Self {
            last_time: 0,
            last_rand_chars: [0; 12],
        }
    }
}

static ID_STATE: LazyLock<Mutex<IdState>> = LazyLock::new(|| Mutex::new(IdState::new()));

/// Returns a 20 character id whose lexical order follows creation order.
///
/// Eight characters encode `now_millis`; the remaining twelve are random, and are incremented
/// instead of re-rolled when two ids are minted in the same millisecond.
pub fn next_id(now_millis: u64) -> String {
    let mut state = ID_STATE.lock().unwrap();
    generate(&mut state, now_millis)
}

fn generate(state: &mut IdState, mut now_millis: u64) -> String {
    let same_millisecond = now_millis == state.last_time;
    state.last_time = now_millis;

    let mut timestamp_chars = [0u8; 8];
    for slot in timestamp_chars.iter_mut().rev() {
        *slot = ID_CHARS[(now_millis % 64) as usize];
        now_millis /= 64;
    }

    if same_millisecond {
        let mut index = state.last_rand_chars.len();
        while index > 0 && state.last_rand_chars[index - 1] == 63 {
            state.last_rand_chars[index - 1] = 0;
            index -= 1;
        }
        if index > 0 {
            state.last_rand_chars[index - 1] += 1;
        }
    } else {
        let mut rng = rand::thread_rng();
        for slot in state.last_rand_chars.iter_mut() {
            *slot = rng.gen_range(0..64);
        }
    }

    let mut id = String::with_capacity(20);
    id.extend(timestamp_chars.iter().map(|c| *c as char));
    id.extend(
        state
            .last_rand_chars
            .iter()
            .map(|index| ID_CHARS[*index as usize] as char),
    );
    id
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn ids_sort_by_creation() {
        let mut state = IdState::new();
        let first = generate(&mut state, 1_700_000_000_000);
        let second = generate(&mut state, 1_700_000_000_000);
        let third = generate(&mut state, 1_700_000_000_001);
        assert_eq!(first.len(), 20);
        assert!(first < second);
        assert!(second < third);
    }
}
