use std::io::Write;

use anyhow::{bail, Result};

/// Structured output for one analysis run. Elements nest; attributes are
/// borrowed (name, value) pairs.
pub trait ReportSink {
    fn open(&mut self, element: &str, attrs: &[(&str, &str)]) -> Result<()>;
    fn leaf(&mut self, element: &str, attrs: &[(&str, &str)]) -> Result<()>;
    fn close(&mut self) -> Result<()>;
}

/// Streaming XML renderer over any writer. Emits the declaration up front,
/// indents two spaces per depth, escapes attribute values.
pub struct XmlWriter<W: Write> {
    out: W,
    stack: Vec<String>,
    wrote_header: bool,
}

impl<W: Write> XmlWriter<W> {
    pub fn new(out: W) -> XmlWriter<W> {
        XmlWriter {
            out,
            stack: Vec::new(),
            wrote_header: false,
        }
    }

    pub fn into_inner(self) -> W {
        self.out
    }

    fn prelude(&mut self) -> Result<()> {
        if !self.wrote_header {
            writeln!(self.out, "<?xml version=\"1.0\" encoding=\"UTF-8\"?>")?;
            self.wrote_header = true;
        }
        for _ in 0..self.stack.len() {
            write!(self.out, "  ")?;
        }
        Ok(())
    }

    fn write_attrs(&mut self, attrs: &[(&str, &str)]) -> Result<()> {
        for (name, value) in attrs {
            write!(self.out, " {}=\"{}\"", name, escape(value))?;
        }
        Ok(())
    }
}

impl<W: Write> ReportSink for XmlWriter<W> {
    fn open(&mut self, element: &str, attrs: &[(&str, &str)]) -> Result<()> {
        self.prelude()?;
        write!(self.out, "<{}", element)?;
        self.write_attrs(attrs)?;
        writeln!(self.out, ">")?;
        self.stack.push(element.to_string());
        Ok(())
    }

    fn leaf(&mut self, element: &str, attrs: &[(&str, &str)]) -> Result<()> {
        self.prelude()?;
        write!(self.out, "<{}", element)?;
        self.write_attrs(attrs)?;
        writeln!(self.out, "/>")?;
        Ok(())
    }

    fn close(&mut self) -> Result<()> {
        let Some(element) = self.stack.pop() else {
            bail!("close() without a matching open()");
        };
        for _ in 0..self.stack.len() {
            write!(self.out, "  ")?;
        }
        writeln!(self.out, "</{}>", element)?;
        self.out.flush()?;
        Ok(())
    }
}

fn escape(value: &str) -> String {
    let mut out = String::with_capacity(value.len());
    for c in value.chars() {
        match c {
            '&' => out.push_str("&amp;"),
            '<' => out.push_str("&lt;"),
            '>' => out.push_str("&gt;"),
            '"' => out.push_str("&quot;"),
            '\'' => out.push_str("&apos;"),
            _ => out.push(c),
        }
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    fn render(build: impl FnOnce(&mut XmlWriter<Vec<u8>>)) -> String {
        let mut w = XmlWriter::new(Vec::new());
        build(&mut w);
        String::from_utf8(w.into_inner()).unwrap()
    }

    #[test]
    fn test_nested_document() {
        let out = render(|w| {
            w.open("analysis-report", &[]).unwrap();
            w.open("leaking-object", &[("class", "java.util.HashMap"), ("size", "1234")])
                .unwrap();
            w.leaf("reference", &[("location", "Registry.cache (Static)")])
                .unwrap();
            w.close().unwrap();
            w.close().unwrap();
        });
        assert_eq!(
            out,
            "<?xml version=\"1.0\" encoding=\"UTF-8\"?>\n\
             <analysis-report>\n\
             \x20 <leaking-object class=\"java.util.HashMap\" size=\"1234\">\n\
             \x20   <reference location=\"Registry.cache (Static)\"/>\n\
             \x20 </leaking-object>\n\
             </analysis-report>\n"
        );
    }

    #[test]
    fn test_attribute_escaping() {
        let out = render(|w| {
            w.leaf("reference", &[("location", "Map<K, V> & \"friends\"")])
                .unwrap();
        });
        assert!(out.contains("Map&lt;K, V&gt; &amp; &quot;friends&quot;"));
    }

    #[test]
    fn test_unmatched_close_is_an_error() {
        let mut w = XmlWriter::new(Vec::new());
        assert!(w.close().is_err());
        w.open("a", &[]).unwrap();
        w.close().unwrap();
        assert!(w.close().is_err());
    }

    #[test]
    fn test_header_written_once() {
        let out = render(|w| {
            w.leaf("a", &[]).unwrap();
            w.leaf("b", &[]).unwrap();
        });
        assert_eq!(out.matches("<?xml").count(), 1);
    }
}
