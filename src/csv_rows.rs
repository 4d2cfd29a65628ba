//! Loose delimited-row handling for shop-floor CSV files.
//!
//! Upstream tools disagree on headers, delimiters and line endings, so a
//! document is kept line by line: the header is optional and detected by
//! known column names, fields are addressed by name when a header exists and
//! by position otherwise, and rows that cannot be parsed are carried through
//! byte for byte.

/// A column addressed by header name, falling back to position.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Field<'a> {
    pub name: &'a str,
    pub index: usize,
}

impl<'a> Field<'a> {
    pub const fn new(name: &'a str, index: usize) -> Self {
        Self { name, index }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Line {
    /// 1-based line number in the source text.
    pub number: usize,
    pub raw: String,
    /// `None` when the line is blank or could not be parsed.
    pub fields: Option<Vec<String>>,
}

impl Line {
    pub fn is_blank(&self) -> bool {
        self.raw.trim().is_empty()
    }
}

/// Output of [`CsvDocument::project`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Projection {
    pub text: String,
    pub rewritten: usize,
    /// Line numbers passed through untouched because they were malformed.
    pub malformed: Vec<usize>,
}

#[derive(Debug, Clone)]
pub struct CsvDocument {
    delimiter: u8,
    line_ending: &'static str,
    trailing_newline: bool,
    header: Option<Vec<String>>,
    lines: Vec<Line>,
}

impl CsvDocument {
    /// Parse `text`. The first non-blank line is a header when any of its
    /// cells equals one of `known_columns` (case-insensitive).
    pub fn parse(text: &str, known_columns: &[&str]) -> Self {
        let text = text.strip_prefix('\u{feff}').unwrap_or(text);
        let line_ending = if text.contains("\r\n") { "\r\n" } else { "\n" };
        let trailing_newline = text.ends_with('\n');

        let first = text.lines().find(|l| !l.trim().is_empty()).unwrap_or("");
        let delimiter = if !first.contains(',') && first.contains(';') {
            b';'
        } else {
            b','
        };

        let mut pieces: Vec<&str> = text.split('\n').collect();
        if trailing_newline {
            pieces.pop();
        }

        let mut lines: Vec<Line> = pieces
            .into_iter()
            .enumerate()
            .map(|(i, piece)| {
                let raw = piece.strip_suffix('\r').unwrap_or(piece).to_string();
                let fields = if raw.trim().is_empty() {
                    None
                } else {
                    split_fields(&raw, delimiter)
                };
                Line {
                    number: i + 1,
                    raw,
                    fields,
                }
            })
            .collect();

        let mut header = None;
        if let Some(first) = lines.iter_mut().find(|l| !l.is_blank()) {
            let is_header = first.fields.as_ref().is_some_and(|cells| {
                cells
                    .iter()
                    .any(|c| known_columns.iter().any(|k| c.trim().eq_ignore_ascii_case(k)))
            });
            if is_header {
                header = first.fields.clone();
                first.fields = None;
            }
        }

        Self {
            delimiter,
            line_ending,
            trailing_newline,
            header,
            lines,
        }
    }

    pub fn header(&self) -> Option<&[String]> {
        self.header.as_deref()
    }

    pub fn delimiter(&self) -> u8 {
        self.delimiter
    }

    /// Every non-blank line except the header, in source order, including
    /// malformed ones (with `fields == None`).
    pub fn data_lines(&self) -> impl Iterator<Item = &Line> {
        let header_line = self.header_line();
        self.lines
            .iter()
            .filter(move |l| !l.is_blank() && Some(l.number) != header_line)
    }

    /// Parsed data rows only.
    pub fn rows(&self) -> impl Iterator<Item = &[String]> {
        self.data_lines().filter_map(|l| l.fields.as_deref())
    }

    fn header_line(&self) -> Option<usize> {
        self.header.as_ref()?;
        self.lines.iter().find(|l| !l.is_blank()).map(|l| l.number)
    }

    /// Resolve a field to a column index. Header names win over positions;
    /// a headed document without the named column has no such field.
    pub fn column(&self, field: Field<'_>) -> Option<usize> {
        match &self.header {
            Some(header) => header
                .iter()
                .position(|h| h.trim().eq_ignore_ascii_case(field.name)),
            None => Some(field.index),
        }
    }

    /// First resolvable column among `fields`.
    pub fn first_column(&self, fields: &[Field<'_>]) -> Option<usize> {
        fields.iter().find_map(|f| self.column(*f))
    }

    pub fn value<'l>(&self, row: &'l [String], field: Field<'_>) -> Option<&'l str> {
        let idx = self.column(field)?;
        row.get(idx).map(|s| s.trim()).filter(|s| !s.is_empty())
    }

    /// Rewrite `overrides` on every data row and render the document,
    /// keeping the header, blank lines, row order and line-ending style.
    pub fn project(&self, overrides: &[(Field<'_>, String)]) -> Projection {
        let targets: Vec<(Option<usize>, &str)> = overrides
            .iter()
            .map(|(field, value)| (self.column(*field), value.as_str()))
            .collect();
        let header_line = self.header_line();

        let mut out = Vec::with_capacity(self.lines.len());
        let mut rewritten = 0;
        let mut malformed = Vec::new();

        for line in &self.lines {
            if line.is_blank() || Some(line.number) == header_line {
                out.push(line.raw.clone());
                continue;
            }
            let Some(fields) = &line.fields else {
                malformed.push(line.number);
                out.push(line.raw.clone());
                continue;
            };
            let fits = targets
                .iter()
                .all(|(idx, _)| idx.is_none_or(|i| i < fields.len()));
            if !fits {
                malformed.push(line.number);
                out.push(line.raw.clone());
                continue;
            }
            let mut fields = fields.clone();
            for (idx, value) in &targets {
                if let Some(i) = idx {
                    fields[*i] = (*value).to_string();
                }
            }
            match join_fields(&fields, self.delimiter) {
                Some(joined) => {
                    rewritten += 1;
                    out.push(joined);
                }
                None => {
                    malformed.push(line.number);
                    out.push(line.raw.clone());
                }
            }
        }

        let mut text = out.join(self.line_ending);
        if self.trailing_newline {
            text.push_str(self.line_ending);
        }
        Projection {
            text,
            rewritten,
            malformed,
        }
    }
}

fn split_fields(raw: &str, delimiter: u8) -> Option<Vec<String>> {
    if raw.matches('"').count() % 2 != 0 {
        return None;
    }
    let mut reader = csv::ReaderBuilder::new()
        .has_headers(false)
        .flexible(true)
        .delimiter(delimiter)
        .from_reader(raw.as_bytes());
    let record = reader.records().next()?.ok()?;
    Some(record.iter().map(|f| f.trim().to_string()).collect())
}

fn join_fields(fields: &[String], delimiter: u8) -> Option<String> {
    let mut writer = csv::WriterBuilder::new()
        .delimiter(delimiter)
        .terminator(csv::Terminator::Any(b'\n'))
        .from_writer(Vec::new());
    writer.write_record(fields).ok()?;
    let bytes = writer.into_inner().ok()?;
    let text = String::from_utf8(bytes).ok()?;
    Some(text.trim_end_matches('\n').to_string())
}
