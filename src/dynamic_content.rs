//! Dynamic slices inside otherwise cached fragments

use std::fmt;
use std::io;

/// Callback that renders a dynamic slice of a cached fragment
///
/// The provider is invoked when the fragment is first rendered and again on
/// every cache hit, at the position where it was registered. Implementors
/// override at least one of the two methods; each defaults to the other.
/// An error aborts assembly of the fragment for the current request.
pub trait DynamicContentProvider: Send + Sync {
    /// Write the dynamic content to a byte sink
    fn provide_bytes(&self, out: &mut dyn io::Write) -> io::Result<()> {
        let mut text = String::new();
        self.provide_text(&mut text)?;
        out.write_all(text.as_bytes())
    }

    /// Write the dynamic content to a character sink
    fn provide_text(&self, out: &mut dyn fmt::Write) -> io::Result<()> {
        let mut bytes = Vec::new();
        self.provide_bytes(&mut bytes)?;
        let text = String::from_utf8(bytes)
            .map_err(|e| io::Error::new(io::ErrorKind::InvalidData, e))?;
        out.write_str(&text)
            .map_err(|_| io::Error::new(io::ErrorKind::Other, "character sink rejected write"))
    }
}

impl fmt::Debug for dyn DynamicContentProvider {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("DynamicContentProvider")
    }
}
