//! Random level assignment.

use super::ml;
use crate::storage::tuple::{ITEM_POINTER_SIZE, NEIGHBOR_HEADER_SIZE};
use crate::storage::{PAGE_SIZE, page::LINE_POINTER_SIZE, page::PAGE_HEADER_SIZE};
use rand::Rng;

/// Highest level whose neighbor tuple still fits on one page.
pub const fn max_level(m: usize) -> u8 {
    let slots = (PAGE_SIZE - PAGE_HEADER_SIZE - NEIGHBOR_HEADER_SIZE - LINE_POINTER_SIZE)
        / ITEM_POINTER_SIZE
        / m;
    let level = slots.saturating_sub(2);
    if level > u8::MAX as usize {
        u8::MAX
    } else {
        level as u8
    }
}

/// Draws element levels from `floor(-ln(U) * ml)`, capped at [`max_level`].
#[derive(Debug, Clone, Copy)]
pub struct LevelGenerator {
    ml: f64,
    max_level: u8,
}

impl LevelGenerator {
    pub fn new(m: usize) -> Self {
        Self {
            ml: ml(m),
            max_level: max_level(m),
        }
    }

    pub fn max_level(&self) -> u8 {
        self.max_level
    }

    pub fn generate(&self) -> u8 {
        self.generate_with(&mut rand::rng())
    }

    pub fn generate_with<R: Rng + ?Sized>(&self, rng: &mut R) -> u8 {
        // 1 - U keeps the argument of ln inside (0, 1]
        let u: f64 = rng.random();
        let level = (-(1.0 - u).ln() * self.ml).floor();
        if level >= f64::from(self.max_level) {
            self.max_level
        } else {
            level as u8
        }
    }
}
