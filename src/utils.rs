//! Small shared helpers.

/// Mixed-radix counter over `radices`, last digit fastest.
///
/// Yields every combination of digits exactly once, then stops. Any zero radix makes the
/// sequence empty.
///
/// ```
/// use chunkforge::utils::Odometer;
///
/// let all: Vec<_> = Odometer::new(vec![2, 3]).collect();
/// assert_eq!(all.len(), 6);
/// assert_eq!(all[0], vec![0, 0]);
/// assert_eq!(all[1], vec![0, 1]);
/// assert_eq!(all[5], vec![1, 2]);
/// ```
#[derive(Clone, Debug)]
pub struct Odometer {
    radices: Vec<usize>,
    cursor: Option<Vec<usize>>,
    remaining: usize,
}

impl Odometer {
    #[must_use]
    pub fn new(radices: Vec<usize>) -> Self {
        let remaining = radices.iter().product();
        let cursor = (remaining > 0).then(|| vec![0; radices.len()]);
        Self { radices, cursor, remaining }
    }
}

impl Iterator for Odometer {
    type Item = Vec<usize>;

    fn next(&mut self) -> Option<Vec<usize>> {
        let cursor = self.cursor.as_mut()?;
        let current = cursor.clone();

        let mut exhausted = true;
        for i in (0..cursor.len()).rev() {
            cursor[i] += 1;
            if cursor[i] < self.radices[i] {
                exhausted = false;
                break;
            }
            cursor[i] = 0;
        }
        if exhausted {
            self.cursor = None;
        }
        self.remaining = self.remaining.saturating_sub(1);
        Some(current)
    }

    fn size_hint(&self) -> (usize, Option<usize>) {
        (self.remaining, Some(self.remaining))
    }
}

impl ExactSizeIterator for Odometer {}
