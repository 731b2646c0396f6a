//! Introspection XML generation.
//!
//! [`introspect_xml`] serialises a [`DispatchTable`] into the standard bus
//! introspection format. Output goes through an [`ExtensibleString`], which
//! grows in fixed steps and never truncates.

use std::fmt;

use pollbus_types::BusError;

use crate::table::{ArgSpec, DispatchTable, Member, MemberKind};

/// Bytes added to an [`ExtensibleString`] each time it runs out of room.
pub const EXTEND_STEP: usize = 16;

/// Document type declaration of introspection data.
pub const INTROSPECT_DOCTYPE: &str = "<!DOCTYPE node PUBLIC \
\"-//freedesktop//DTD D-BUS Object Introspection 1.0//EN\"\n\
\"http://www.freedesktop.org/standards/dbus/1.0/introspect.dtd\">";

/// A string buffer that grows by [`EXTEND_STEP`] bytes at a time.
///
/// Every append is a bounded write into the spare capacity. When the
/// formatted output does not fit, the partial write is rolled back, the
/// buffer grows by one step, and the same formatted write is tried again.
#[derive(Debug)]
pub struct ExtensibleString {
    buf: String,
}

impl ExtensibleString {
    /// An empty buffer with [`EXTEND_STEP`] bytes of capacity.
    ///
    /// # Errors
    ///
    /// [`BusError::OutOfMemory`] if the initial allocation fails.
    pub fn new() -> Result<Self, BusError> {
        let mut buf = String::new();
        buf.try_reserve_exact(EXTEND_STEP)
            .map_err(|e| BusError::OutOfMemory(format!("string buffer: {e}")))?;
        Ok(Self { buf })
    }

    pub fn as_str(&self) -> &str {
        &self.buf
    }

    pub fn len(&self) -> usize {
        self.buf.len()
    }

    pub fn is_empty(&self) -> bool {
        self.buf.is_empty()
    }

    pub fn capacity(&self) -> usize {
        self.buf.capacity()
    }

    pub fn into_string(self) -> String {
        self.buf
    }

    /// Append formatted output.
    ///
    /// # Errors
    ///
    /// [`BusError::OutOfMemory`] if the buffer cannot grow. The content
    /// written before the call is left intact.
    pub fn append(&mut self, args: fmt::Arguments<'_>) -> Result<(), BusError> {
        loop {
            let start = self.buf.len();
            let limit = self.buf.capacity();
            let mut bounded = Bounded {
                buf: &mut self.buf,
                limit,
                overflowed: false,
            };
            let result = fmt::write(&mut bounded, args);
            let overflowed = bounded.overflowed;
            match result {
                Ok(()) => return Ok(()),
                Err(_) if overflowed => {
                    self.buf.truncate(start);
                    self.extend()?;
                }
                Err(_) => {
                    self.buf.truncate(start);
                    return Err(BusError::InvalidArgument(
                        "formatting an appended value failed".to_string(),
                    ));
                }
            }
        }
    }

    pub fn append_str(&mut self, s: &str) -> Result<(), BusError> {
        self.append(format_args!("{s}"))
    }

    fn extend(&mut self) -> Result<(), BusError> {
        let additional = self.buf.capacity() + EXTEND_STEP - self.buf.len();
        self.buf
            .try_reserve_exact(additional)
            .map_err(|e| BusError::OutOfMemory(format!("string buffer: {e}")))
    }
}

impl fmt::Write for ExtensibleString {
    fn write_str(&mut self, s: &str) -> fmt::Result {
        self.append_str(s).map_err(|_| fmt::Error)
    }

    fn write_fmt(&mut self, args: fmt::Arguments<'_>) -> fmt::Result {
        self.append(args).map_err(|_| fmt::Error)
    }
}

impl fmt::Display for ExtensibleString {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.buf)
    }
}

// Writer that refuses to grow its target past `limit` bytes.
struct Bounded<'a> {
    buf: &'a mut String,
    limit: usize,
    overflowed: bool,
}

impl fmt::Write for Bounded<'_> {
    fn write_str(&mut self, s: &str) -> fmt::Result {
        if self.buf.len() + s.len() > self.limit {
            self.overflowed = true;
            return Err(fmt::Error);
        }
        self.buf.push_str(s);
        Ok(())
    }
}

// ────────────────────────────────────────────────────────────────────────────
// Document generation
// ────────────────────────────────────────────────────────────────────────────

/// Introspection document for `table`, listing `children` as child nodes.
///
/// # Errors
///
/// [`BusError::OutOfMemory`] if the document cannot be buffered.
pub fn introspect_xml<T>(table: &DispatchTable<T>, children: &[String]) -> Result<String, BusError> {
    let mut out = ExtensibleString::new()?;
    out.append(format_args!("{INTROSPECT_DOCTYPE}\n"))?;
    out.append_str("<node>")?;
    for interface in table.interfaces() {
        out.append(format_args!("<interface name=\"{}\">", interface.name()))?;
        for member in interface.members() {
            write_member(&mut out, member)?;
        }
        out.append_str("</interface>")?;
    }
    for child in children {
        out.append(format_args!("<node name=\"{child}\"/>"))?;
    }
    out.append_str("</node>")?;
    Ok(out.into_string())
}

fn write_member<T>(out: &mut ExtensibleString, member: &Member<T>) -> Result<(), BusError> {
    let tag = match member.kind() {
        MemberKind::Method => "method",
        MemberKind::Signal => "signal",
    };
    out.append(format_args!("<{tag} name=\"{}\">", member.name()))?;
    for arg in member.args() {
        write_arg(out, arg)?;
    }
    out.append(format_args!("</{tag}>"))
}

fn write_arg(out: &mut ExtensibleString, arg: &ArgSpec) -> Result<(), BusError> {
    out.append(format_args!(
        "<arg name=\"{}\" type=\"{}\" direction=\"{}\" />",
        arg.name,
        arg.signature,
        arg.direction.as_str()
    ))
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;
    use std::fmt::Write as _;

    struct Nothing;

    #[test]
    fn starts_with_one_step_of_capacity() {
        let s = ExtensibleString::new().unwrap();
        assert!(s.is_empty());
        assert!(s.capacity() >= EXTEND_STEP);
    }

    #[test]
    fn long_append_grows_without_truncating() {
        let mut s = ExtensibleString::new().unwrap();
        s.append_str("0123456789").unwrap();
        let long = "x".repeat(100);
        s.append(format_args!("<{long}>")).unwrap();
        assert_eq!(s.as_str(), format!("0123456789<{long}>"));
        assert!(s.capacity() >= s.len());
    }

    #[test]
    fn write_macro_goes_through_append() {
        let mut s = ExtensibleString::new().unwrap();
        write!(s, "{}-{}", 40, "two").unwrap();
        write!(s, "{:>20}", "right").unwrap();
        assert_eq!(s.to_string(), format!("40-two{:>20}", "right"));
    }

    #[test]
    fn single_method_with_in_argument() {
        let table = DispatchTable::<Nothing>::builder()
            .interface("org.example.Echo", |i| {
                i.method("Say", [ArgSpec::input("text", "s")], |_, _, _| Ok(()))
            })
            .build();
        let xml = introspect_xml(&table, &[]).unwrap();

        assert!(xml.starts_with(INTROSPECT_DOCTYPE));
        assert_eq!(xml.matches("<method ").count(), 1);
        assert!(xml.contains(
            "<method name=\"Say\"><arg name=\"text\" type=\"s\" direction=\"in\" /></method>"
        ));
        assert!(xml.ends_with("</interface></node>"));
    }

    #[test]
    fn signals_and_children() {
        let table = DispatchTable::<Nothing>::builder()
            .interface("org.example.Clock", |i| {
                i.signal("Tick", [ArgSpec::output("seq", "u")])
            })
            .build();
        let children = vec!["left".to_string(), "right".to_string()];
        let xml = introspect_xml(&table, &children).unwrap();

        let expected = format!(
            "{INTROSPECT_DOCTYPE}\n<node><interface name=\"org.example.Clock\">\
             <signal name=\"Tick\"><arg name=\"seq\" type=\"u\" direction=\"out\" /></signal>\
             </interface><node name=\"left\"/><node name=\"right\"/></node>"
        );
        assert_eq!(xml, expected);
    }

    proptest! {
        #[test]
        fn appends_concatenate_exactly(parts in proptest::collection::vec(".{0,80}", 0..24)) {
            let mut s = ExtensibleString::new().unwrap();
            for part in &parts {
                s.append(format_args!("{part}")).unwrap();
            }
            prop_assert_eq!(s.as_str(), parts.concat());
        }
    }
}
