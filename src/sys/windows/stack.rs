use std::io;

/// Task stack parameters. On this platform the fiber owns the actual
/// allocation: `CreateFiberEx` reserves `reserve` bytes, commits `commit`
/// up front and grows the rest on demand behind a guard page.
pub(crate) struct Stack {
    reserve: usize,
    commit: usize,
}

const INITIAL_COMMIT: usize = 64 * 1024;

impl Stack {
    pub(crate) fn new(size: usize) -> io::Result<Stack> {
        Ok(Stack {
            reserve: size.max(INITIAL_COMMIT),
            commit: INITIAL_COMMIT,
        })
    }

    pub(crate) fn reserve(&self) -> usize {
        self.reserve
    }

    pub(crate) fn commit(&self) -> usize {
        self.commit
    }
}
