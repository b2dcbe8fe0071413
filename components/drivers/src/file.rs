//! File operations bound to the device node

use cap_broker::{FileContext, FileOperations, UserBuffer};

use crate::{MessageSource, SessionTracker, DEVICE_NAME};

/// Read-only file backed by a [`MessageSource`]
#[derive(Debug, Default)]
pub struct DeviceFile {
    source: MessageSource,
    sessions: SessionTracker,
}

impl DeviceFile {
    pub fn new(source: MessageSource) -> Self {
        Self {
            source,
            sessions: SessionTracker::default(),
        }
    }

    pub fn source(&self) -> &MessageSource {
        &self.source
    }

    pub fn sessions(&self) -> &SessionTracker {
        &self.sessions
    }
}

impl FileOperations for DeviceFile {
    fn open(&self, ctx: &FileContext) -> cap_broker::Result<()> {
        self.sessions.opened(ctx);
        Ok(())
    }

    fn release(&self, ctx: &FileContext) {
        self.sessions.released(ctx);
    }

    fn read(&self, ctx: &FileContext, buf: &mut dyn UserBuffer, offset: &mut u64) -> cap_broker::Result<usize> {
        let n = self.source.read(*offset, buf)?;
        *offset += n as u64;
        log::debug!(
            "{}: session {} read {} bytes, now at {}",
            DEVICE_NAME,
            ctx.session(),
            n,
            offset
        );
        Ok(n)
    }
}
