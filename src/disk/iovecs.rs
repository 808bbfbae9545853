//! Buffer-list bookkeeping for writing a piece's blocks across the one or
//! more files it overlaps with, via `pwritev`.
//!
//! A piece's blocks are collected into a flat list of [`IoVec`]s. When a
//! piece spans multiple files, [`IoVecs::bounded`] carves off a prefix of
//! at most `limit` bytes for the current file, splitting the buffer that
//! straddles the boundary; [`IoVecs::into_tail`] hands back the rest for
//! the next file. [`IoVecs::advance`] records a (possibly partial)
//! `pwritev` write, as the syscall isn't guaranteed to consume the whole
//! buffer list in one go.

pub(crate) type IoVec<'a> = nix::sys::uio::IoVec<&'a [u8]>;

pub(crate) struct IoVecs<'a> {
    bufs: &'a mut [IoVec<'a>],
    /// The first buffer in the current window, i.e. not yet fully written.
    start: usize,
    /// One past the last buffer included in the current window.
    window_end: usize,
    /// Set when the buffer at this index was truncated to respect a
    /// `limit`; holds the bytes held back so `into_tail` can restore them.
    split_tail: Option<(usize, &'a [u8])>,
}

impl<'a> IoVecs<'a> {
    /// Exposes the entire buffer list, for the common case of a piece
    /// contained within a single file.
    pub fn unbounded(bufs: &'a mut [IoVec<'a>]) -> Self {
        let window_end = bufs.len();
        Self {
            bufs,
            start: 0,
            window_end,
            split_tail: None,
        }
    }

    /// Exposes at most `limit` bytes of the buffer list, splitting the
    /// buffer that straddles the boundary, if any.
    pub fn bounded(bufs: &'a mut [IoVec<'a>], limit: usize) -> Self {
        let mut seen = 0;
        let mut window_end = bufs.len();
        let mut split_tail = None;

        for (i, buf) in bufs.iter_mut().enumerate() {
            let full = buf.as_slice();
            let len = full.len();
            if seen + len > limit {
                let take = limit - seen;
                let (head, tail) = full.split_at(take);
                *buf = IoVec::from_slice(head);
                split_tail = Some((i, tail));
                window_end = i + 1;
                break;
            }
            seen += len;
            if seen == limit {
                window_end = i + 1;
                break;
            }
        }

        Self {
            bufs,
            start: 0,
            window_end,
            split_tail,
        }
    }

    /// The buffers not yet written out, bounded by `limit` if one was given.
    pub fn buffers(&self) -> &[IoVec<'a>] {
        &self.bufs[self.start..self.window_end]
    }

    /// Records that `n` bytes at the front of the current window have been
    /// written, advancing past any buffer they fully cover and truncating
    /// the one they partially cover.
    pub fn advance(&mut self, mut n: usize) {
        while n > 0 && self.start < self.window_end {
            let len = self.bufs[self.start].as_slice().len();
            if n < len {
                let rest = &self.bufs[self.start].as_slice()[n..];
                self.bufs[self.start] = IoVec::from_slice(rest);
                n = 0;
            } else {
                n -= len;
                self.start += 1;
            }
        }
    }

    /// Returns the unwritten remainder of the original buffer list: any
    /// bytes held back by `bounded`'s split, followed by the buffers past
    /// the original window.
    ///
    /// # Panics
    ///
    /// Panics if the current window has not been fully written (i.e.
    /// `buffers()` is not empty).
    pub fn into_tail(self) -> &'a mut [IoVec<'a>] {
        assert_eq!(
            self.start, self.window_end,
            "into_tail called before the current window was drained"
        );
        let Self {
            bufs,
            window_end,
            split_tail,
            ..
        } = self;
        if let Some((idx, tail)) = split_tail {
            bufs[idx] = IoVec::from_slice(tail);
            &mut bufs[idx..]
        } else {
            &mut bufs[window_end..]
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn unbounded_exposes_every_buffer() {
        let a = vec![1u8; 4];
        let b = vec![2u8; 4];
        let mut bufs = vec![IoVec::from_slice(&a), IoVec::from_slice(&b)];
        let iovecs = IoVecs::unbounded(&mut bufs);
        assert_eq!(iovecs.buffers().len(), 2);
    }

    #[test]
    fn advance_drains_whole_buffers_then_partial() {
        let a = vec![1u8; 4];
        let b = vec![2u8; 4];
        let mut bufs = vec![IoVec::from_slice(&a), IoVec::from_slice(&b)];
        let mut iovecs = IoVecs::unbounded(&mut bufs);
        iovecs.advance(4);
        assert_eq!(iovecs.buffers().len(), 1);
        iovecs.advance(2);
        assert_eq!(iovecs.buffers()[0].as_slice().len(), 2);
        iovecs.advance(2);
        assert!(iovecs.buffers().is_empty());
    }

    #[test]
    fn bounded_splits_straddling_buffer_and_recovers_tail() {
        let a = vec![1u8; 4];
        let b = vec![2u8; 4];
        let mut bufs = vec![IoVec::from_slice(&a), IoVec::from_slice(&b)];
        let mut iovecs = IoVecs::bounded(&mut bufs, 6);
        let total: usize =
            iovecs.buffers().iter().map(|v| v.as_slice().len()).sum();
        assert_eq!(total, 6);
        iovecs.advance(6);
        let tail = iovecs.into_tail();
        let tail_len: usize =
            tail.iter().map(|v| v.as_slice().len()).sum();
        assert_eq!(tail_len, 2);
    }

    #[test]
    fn bounded_on_exact_buffer_boundary_needs_no_split() {
        let a = vec![1u8; 4];
        let b = vec![2u8; 4];
        let mut bufs = vec![IoVec::from_slice(&a), IoVec::from_slice(&b)];
        let mut iovecs = IoVecs::bounded(&mut bufs, 4);
        assert_eq!(iovecs.buffers().len(), 1);
        iovecs.advance(4);
        let tail = iovecs.into_tail();
        assert_eq!(tail.len(), 1);
        assert_eq!(tail[0].as_slice().len(), 4);
    }
}
