//! # Fish Model
//!
//! The movable object owned by exactly one tank at a time. A fish swims
//! horizontally, wobbles vertically, and is handed to a ring neighbor when it
//! reaches a tank edge while its owner holds the token.

use rand::Rng;
use serde::{Deserialize, Serialize};

use super::messages::Direction;

/// Tank width in pixels.
pub const WIDTH: i32 = 600;
/// Tank height in pixels.
pub const HEIGHT: i32 = 350;
pub const FISH_WIDTH: i32 = 100;
pub const FISH_HEIGHT: i32 = 50;

/// Lifecycle of a fish inside one tank.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum FishPhase {
    /// Owned and visible.
    Swimming,
    /// Handed off; still drawn while it slides out of view.
    Departing,
    /// Fully outside the visible area, due for removal.
    Disappeared,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FishModel {
    pub id: String,
    pub x: i32,
    pub y: i32,
    pub direction: Direction,
    pub phase: FishPhase,
    /// Highlight flag flipped when a location query finds this fish.
    pub toggled: bool,
}

impl FishModel {
    /// Create a swimming fish, clamping its position into the tank.
    ///
    /// # Arguments
    /// - `id`: Globally unique id (`fish<n>@<tankId>`)
    /// - `x`, `y`: Requested top-left corner
    /// - `direction`: Initial heading
    pub fn new(id: String, x: i32, y: i32, direction: Direction) -> Self {
        Self {
            id,
            x: x.clamp(0, WIDTH - FISH_WIDTH - 1),
            y: y.clamp(0, HEIGHT - FISH_HEIGHT),
            direction,
            phase: FishPhase::Swimming,
            toggled: false,
        }
    }

    /// Create a fish at `(x, y)` with a random heading.
    pub fn spawn(id: String, x: i32, y: i32) -> Self {
        let direction = if rand::thread_rng().gen_bool(0.5) {
            Direction::Right
        } else {
            Direction::Left
        };
        Self::new(id, x, y, direction)
    }

    pub fn is_swimming(&self) -> bool {
        self.phase == FishPhase::Swimming
    }

    pub fn is_departing(&self) -> bool {
        self.phase == FishPhase::Departing
    }

    pub fn disappeared(&self) -> bool {
        self.phase == FishPhase::Disappeared
    }

    /// True when a swimming fish touches the edge it is heading for.
    pub fn hits_edge(&self) -> bool {
        if !self.is_swimming() {
            return false;
        }
        match self.direction {
            Direction::Left => self.x <= 0,
            Direction::Right => self.x >= WIDTH - FISH_WIDTH,
        }
    }

    /// Advance one simulation tick.
    ///
    /// A departing fish keeps sliding until it is fully out of view and then
    /// becomes [`FishPhase::Disappeared`].
    pub fn update<R: Rng>(&mut self, rng: &mut R) {
        self.x += self.direction.vector();

        if rng.gen_ratio(1, 20) {
            let wobble = if rng.gen_bool(0.5) { 1 } else { -1 };
            self.y = (self.y + wobble).clamp(0, HEIGHT - FISH_HEIGHT);
        }

        if self.is_departing() {
            let gone = match self.direction {
                Direction::Left => self.x <= -FISH_WIDTH,
                Direction::Right => self.x >= WIDTH,
            };
            if gone {
                self.phase = FishPhase::Disappeared;
            }
        }
    }

    pub fn depart(&mut self) {
        self.phase = FishPhase::Departing;
    }

    pub fn reverse(&mut self) {
        self.direction = self.direction.reverse();
    }

    pub fn toggle(&mut self) {
        self.toggled = !self.toggled;
    }

    /// Place a freshly received fish just outside the boundary it crossed.
    pub fn set_to_start(&mut self) {
        self.x = match self.direction {
            Direction::Right => -FISH_WIDTH,
            Direction::Left => WIDTH,
        };
        self.phase = FishPhase::Swimming;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rand::rngs::StdRng;
    use rand::SeedableRng;

    #[test]
    fn new_fish_is_clamped_into_the_tank() {
        let fish = FishModel::new("fish0@tank0".into(), 10_000, -5, Direction::Left);
        assert_eq!(fish.x, WIDTH - FISH_WIDTH - 1);
        assert_eq!(fish.y, 0);
        assert!(fish.is_swimming());
    }

    #[test]
    fn right_swimmer_hits_right_edge() {
        let mut rng = StdRng::seed_from_u64(7);
        let mut fish = FishModel::new("fish0@tank0".into(), WIDTH - FISH_WIDTH - 1, 10, Direction::Right);
        assert!(!fish.hits_edge());
        fish.update(&mut rng);
        assert!(fish.hits_edge());
    }

    #[test]
    fn departing_fish_disappears_once_out_of_view() {
        let mut rng = StdRng::seed_from_u64(7);
        let mut fish = FishModel::new("fish0@tank0".into(), 0, 10, Direction::Left);
        fish.depart();
        assert!(!fish.hits_edge());

        for _ in 0..(FISH_WIDTH - 1) {
            fish.update(&mut rng);
        }
        assert!(fish.is_departing());
        fish.update(&mut rng);
        assert!(fish.disappeared());
    }

    #[test]
    fn received_fish_starts_outside_the_crossed_boundary() {
        let mut fish = FishModel::new("fish1@tank2".into(), 300, 10, Direction::Right);
        fish.depart();
        fish.set_to_start();
        assert_eq!(fish.x, -FISH_WIDTH);
        assert!(fish.is_swimming());

        fish.reverse();
        fish.set_to_start();
        assert_eq!(fish.x, WIDTH);
    }

    #[test]
    fn wobble_stays_inside_the_tank() {
        let mut rng = StdRng::seed_from_u64(42);
        let mut fish = FishModel::new("fish0@tank0".into(), 200, 0, Direction::Right);
        for _ in 0..2_000 {
            fish.update(&mut rng);
            assert!(fish.y >= 0 && fish.y <= HEIGHT - FISH_HEIGHT);
            if fish.hits_edge() {
                fish.reverse();
            }
        }
    }
}
