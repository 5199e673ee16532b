use std::fs::File;
use std::io::{self, Cursor, Empty, Read};

/// A readable stream that must be explicitly closed when the caller is done with it.
///
/// Dropping still releases the underlying resource; `close` exists so that
/// errors raised while closing reach the caller instead of being swallowed by `Drop`.
pub trait ReadClose: Read + Send {
    fn close(&mut self) -> io::Result<()>;
}

pub type BoxReadClose = Box<dyn ReadClose>;

impl<R: ReadClose + ?Sized> ReadClose for Box<R> {
    fn close(&mut self) -> io::Result<()> {
        (**self).close()
    }
}

impl ReadClose for File {
    fn close(&mut self) -> io::Result<()> {
        // The descriptor itself is released on drop.
        Ok(())
    }
}

impl<T: AsRef<[u8]> + Send> ReadClose for Cursor<T> {
    fn close(&mut self) -> io::Result<()> {
        Ok(())
    }
}

impl ReadClose for Empty {
    fn close(&mut self) -> io::Result<()> {
        Ok(())
    }
}
