use std::collections::VecDeque;

#[derive(Clone, Copy, Debug)]
struct Entry {
    score: u64,
    value: u64,
    pos: usize,
}

/// Largest minimizer window, in bases, that the encoders accept.
pub const MAX_WINDOW: usize = 1 << 16;

/// Sliding-window minimum over a stream of k-mer positions.
///
/// Monotone deque: scores increase from front to back, and an equal score
/// never evicts an older entry, so ties resolve to the leftmost position.
#[derive(Clone, Debug)]
pub struct MinimizerWindow {
    width: usize,
    pos: usize,
    deque: VecDeque<Entry>,
}

impl MinimizerWindow {
    /// A window over `width` consecutive positions.
    pub fn new(width: usize) -> Self {
        assert!(width > 0);
        Self {
            width,
            pos: 0,
            deque: VecDeque::with_capacity(width),
        }
    }

    pub fn width(&self) -> usize {
        self.width
    }

    pub fn reset(&mut self) {
        self.pos = 0;
        self.deque.clear();
    }

    /// Push the next position, `None` when it holds no valid k-mer.
    ///
    /// Returns the minimizer of the window ending here, once the window is
    /// full and contains at least one valid k-mer.
    #[inline]
    pub fn push(&mut self, item: Option<(u64, u64)>) -> Option<u64> {
        let pos = self.pos;
        self.pos += 1;
        if let Some((score, value)) = item {
            while self.deque.back().is_some_and(|e| e.score > score) {
                self.deque.pop_back();
            }
            self.deque.push_back(Entry { score, value, pos });
        }
        while self.deque.front().is_some_and(|e| e.pos + self.width <= pos) {
            self.deque.pop_front();
        }
        if pos + 1 < self.width {
            return None;
        }
        self.deque.front().map(|e| e.value)
    }
}

#[cfg(test)]
mod test {
    use super::*;

    fn brute(items: &[Option<u64>], width: usize) -> Vec<u64> {
        items
            .windows(width)
            .filter_map(|w| {
                w.iter()
                    .enumerate()
                    .filter_map(|(i, x)| x.map(|x| (x, i)))
                    .min()
                    .map(|(x, _)| x)
            })
            .collect()
    }

    #[test]
    fn matches_brute_force() {
        for _ in 0..200 {
            let n = rand::random_range(0..200);
            let width = rand::random_range(1..20);
            let items: Vec<Option<u64>> = (0..n)
                .map(|_| {
                    (rand::random_range(0..10) > 0).then(|| rand::random_range(0..50u64))
                })
                .collect();
            let mut window = MinimizerWindow::new(width);
            let got: Vec<u64> = items
                .iter()
                .filter_map(|x| window.push(x.map(|x| (x, x))))
                .collect();
            assert_eq!(got, brute(&items, width));
        }
    }

    #[test]
    fn ties_pick_leftmost() {
        let mut window = MinimizerWindow::new(3);
        // Same score, different payloads.
        assert_eq!(window.push(Some((5, 100))), None);
        assert_eq!(window.push(Some((5, 200))), None);
        assert_eq!(window.push(Some((7, 300))), Some(100));
        assert_eq!(window.push(Some((9, 400))), Some(200));
    }

    #[test]
    fn empty_windows_are_skipped() {
        let mut window = MinimizerWindow::new(2);
        assert_eq!(window.push(Some((1, 1))), None);
        assert_eq!(window.push(None), Some(1));
        assert_eq!(window.push(None), None);
        assert_eq!(window.push(Some((3, 3))), Some(3));
        window.reset();
        assert_eq!(window.push(Some((0, 0))), None);
    }
}
