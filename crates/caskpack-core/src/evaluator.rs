use std::collections::BTreeMap;

use anyhow::{anyhow, Context, Result};

use crate::artifact::ArtifactDescriptor;
use crate::definition::{DefinitionBuilder, PackageDefinition};

/// Turns definition source text into a [`PackageDefinition`].
pub trait Evaluator: Send + Sync {
    fn evaluate(&self, source: &str) -> Result<PackageDefinition>;
}

/// Line-oriented evaluator for the `cask "token" do ... end` stanza format.
///
/// Each body line is one stanza: a keyword followed by comma-separated
/// arguments. Arguments are quoted strings, `:symbols`, `true`/`false`,
/// string lists in brackets, or `key: value` pairs.
#[derive(Debug, Clone, Copy, Default)]
pub struct StanzaEvaluator;

impl Evaluator for StanzaEvaluator {
    fn evaluate(&self, source: &str) -> Result<PackageDefinition> {
        let lines = source
            .lines()
            .map(str::trim)
            .filter(|line| !line.is_empty() && !line.starts_with('#'))
            .collect::<Vec<_>>();

        let (header, body) = lines
            .split_first()
            .ok_or_else(|| anyhow!("definition source is empty"))?;
        let (footer, body) = body
            .split_last()
            .ok_or_else(|| anyhow!("definition is missing its closing line"))?;

        let (token, closer) = parse_header(header)?;
        if *footer != closer {
            return Err(anyhow!("definition must end with '{closer}', found '{footer}'"));
        }

        let mut builder = DefinitionBuilder::new(&token)?;
        for (index, line) in body.iter().enumerate() {
            apply_stanza(&mut builder, line)
                .with_context(|| format!("invalid stanza on body line {}: {line}", index + 1))?;
        }

        Ok(builder.build()?.with_source_text(source))
    }
}

/// Returns the header token and the line expected to close the block.
fn parse_header(header: &str) -> Result<(String, &'static str)> {
    let rest = header
        .strip_prefix("cask")
        .ok_or_else(|| anyhow!("definition must start with a cask header: '{header}'"))?;
    let rest = rest.trim_start();

    if let Some(inner) = rest.strip_prefix('(') {
        let (args, tail) = inner
            .split_once(')')
            .ok_or_else(|| anyhow!("unterminated cask header arguments: '{header}'"))?;
        if tail.trim() != "{" {
            return Err(anyhow!("parenthesized cask header must open a block: '{header}'"));
        }
        return Ok((single_string_arg(args)?, "}"));
    }

    let args = rest
        .strip_suffix("do")
        .ok_or_else(|| anyhow!("cask header must end with 'do': '{header}'"))?;
    Ok((single_string_arg(args)?, "end"))
}

fn single_string_arg(raw: &str) -> Result<String> {
    let args = parse_args(raw)?;
    match args.positional.as_slice() {
        [Value::Str(token)] if args.keywords.is_empty() => Ok(token.clone()),
        _ => Err(anyhow!("cask header takes exactly one quoted token: '{raw}'")),
    }
}

fn apply_stanza(builder: &mut DefinitionBuilder, line: &str) -> Result<()> {
    let (keyword, rest) = match line.split_once(char::is_whitespace) {
        Some((keyword, rest)) => (keyword, rest),
        None => (line, ""),
    };
    let args = parse_args(rest)?;

    match keyword {
        "version" => {
            builder.version(&args.single_text()?)?;
        }
        "sha256" => {
            builder.sha256(&args.single_text()?)?;
        }
        "url" => {
            builder.url(&args.first_str()?)?;
        }
        "name" => {
            builder.name(&args.single_text()?);
        }
        "desc" => {
            builder.desc(&args.single_text()?)?;
        }
        "homepage" => {
            builder.homepage(&args.single_text()?)?;
        }
        "auto_updates" => match args.positional.as_slice() {
            [Value::Bool(value)] => {
                builder.auto_updates(*value);
            }
            _ => return Err(anyhow!("auto_updates takes true or false")),
        },
        "depends_on" => {
            for token in args.keyword_strings("cask")? {
                builder.depends_on_cask(&token)?;
            }
        }
        "conflicts_with" => {
            for token in args.keyword_strings("cask")? {
                builder.conflicts_with_cask(&token)?;
            }
        }
        "app" => {
            builder.artifact(ArtifactDescriptor::App {
                source: args.first_str()?,
                target: args.optional_keyword_str("target")?,
            })?;
        }
        "binary" => {
            builder.artifact(ArtifactDescriptor::Binary {
                source: args.first_str()?,
                target: args.optional_keyword_str("target")?,
            })?;
        }
        "pkg" => {
            builder.artifact(ArtifactDescriptor::Pkg {
                path: args.first_str()?,
            })?;
        }
        "uninstall" => {
            builder.artifact(ArtifactDescriptor::Uninstall {
                pkgutil: args.keyword_strings("pkgutil")?,
            })?;
        }
        other => return Err(anyhow!("unknown stanza '{other}'")),
    }
    Ok(())
}

#[derive(Debug, Clone, PartialEq, Eq)]
enum Value {
    Str(String),
    Symbol(String),
    Bool(bool),
    List(Vec<Value>),
}

#[derive(Debug, Default)]
struct Args {
    positional: Vec<Value>,
    keywords: BTreeMap<String, Value>,
}

impl Args {
    fn first_str(&self) -> Result<String> {
        match self.positional.first() {
            Some(Value::Str(value)) => Ok(value.clone()),
            _ => Err(anyhow!("expected a quoted string argument")),
        }
    }

    /// A single string or symbol, e.g. `version "1.0"` or `version :latest`.
    fn single_text(&self) -> Result<String> {
        match self.positional.as_slice() {
            [Value::Str(value)] | [Value::Symbol(value)] if self.keywords.is_empty() => {
                Ok(value.clone())
            }
            _ => Err(anyhow!("expected exactly one string or symbol argument")),
        }
    }

    fn optional_keyword_str(&self, key: &str) -> Result<Option<String>> {
        match self.keywords.get(key) {
            None => Ok(None),
            Some(Value::Str(value)) => Ok(Some(value.clone())),
            Some(_) => Err(anyhow!("'{key}:' expects a quoted string")),
        }
    }

    fn keyword_strings(&self, key: &str) -> Result<Vec<String>> {
        let value = self
            .keywords
            .get(key)
            .ok_or_else(|| anyhow!("missing '{key}:' argument"))?;
        match value {
            Value::Str(value) => Ok(vec![value.clone()]),
            Value::List(values) => values
                .iter()
                .map(|value| match value {
                    Value::Str(value) => Ok(value.clone()),
                    _ => Err(anyhow!("'{key}:' list entries must be quoted strings")),
                })
                .collect(),
            _ => Err(anyhow!("'{key}:' expects a string or a list of strings")),
        }
    }
}

fn parse_args(raw: &str) -> Result<Args> {
    let mut args = Args::default();
    let mut cursor = Cursor::new(raw);

    loop {
        cursor.skip_separators();
        if cursor.is_done() {
            break;
        }

        if let Some(key) = cursor.try_keyword() {
            cursor.skip_whitespace();
            let value = cursor.value()?;
            if args.keywords.insert(key.clone(), value).is_some() {
                return Err(anyhow!("duplicate '{key}:' argument"));
            }
        } else {
            if !args.keywords.is_empty() {
                return Err(anyhow!("positional arguments must precede keyword arguments"));
            }
            args.positional.push(cursor.value()?);
        }
    }

    Ok(args)
}

struct Cursor<'a> {
    chars: std::iter::Peekable<std::str::CharIndices<'a>>,
    raw: &'a str,
}

impl<'a> Cursor<'a> {
    fn new(raw: &'a str) -> Self {
        Self {
            chars: raw.char_indices().peekable(),
            raw,
        }
    }

    fn is_done(&mut self) -> bool {
        self.chars.peek().is_none()
    }

    fn skip_whitespace(&mut self) {
        while self.chars.next_if(|(_, ch)| ch.is_whitespace()).is_some() {}
    }

    fn skip_separators(&mut self) {
        while self
            .chars
            .next_if(|(_, ch)| ch.is_whitespace() || *ch == ',')
            .is_some()
        {}
    }

    /// Consumes `ident:` when the upcoming text is a keyword key.
    fn try_keyword(&mut self) -> Option<String> {
        let (start, first) = *self.chars.peek()?;
        if !(first.is_ascii_alphabetic() || first == '_') {
            return None;
        }
        let raw = self.raw;
        let rest = &raw[start..];
        let len = rest
            .find(|ch: char| !(ch.is_ascii_alphanumeric() || ch == '_'))
            .unwrap_or(rest.len());
        if !rest[len..].starts_with(':') {
            return None;
        }
        for _ in 0..=len {
            self.chars.next();
        }
        Some(rest[..len].to_string())
    }

    fn value(&mut self) -> Result<Value> {
        let Some(&(start, ch)) = self.chars.peek() else {
            return Err(anyhow!("expected a value"));
        };
        match ch {
            '"' | '\'' => self.quoted(ch).map(Value::Str),
            '[' => {
                self.chars.next();
                let mut items = Vec::new();
                loop {
                    self.skip_separators();
                    match self.chars.peek() {
                        Some((_, ']')) => {
                            self.chars.next();
                            break;
                        }
                        Some(_) => items.push(self.value()?),
                        None => return Err(anyhow!("unterminated list")),
                    }
                }
                Ok(Value::List(items))
            }
            ':' => {
                self.chars.next();
                let ident = self.identifier();
                if ident.is_empty() {
                    return Err(anyhow!("empty symbol"));
                }
                Ok(Value::Symbol(ident))
            }
            _ => {
                let ident = self.identifier();
                match ident.as_str() {
                    "true" => Ok(Value::Bool(true)),
                    "false" => Ok(Value::Bool(false)),
                    _ => Err(anyhow!(
                        "unexpected token at column {}: '{}'",
                        start + 1,
                        &self.raw[start..]
                    )),
                }
            }
        }
    }

    fn identifier(&mut self) -> String {
        let mut ident = String::new();
        while let Some((_, ch)) = self
            .chars
            .next_if(|(_, ch)| ch.is_ascii_alphanumeric() || *ch == '_')
        {
            ident.push(ch);
        }
        ident
    }

    fn quoted(&mut self, quote: char) -> Result<String> {
        self.chars.next();
        let mut out = String::new();
        while let Some((_, ch)) = self.chars.next() {
            if ch == quote {
                return Ok(out);
            }
            if ch == '\\' {
                let (_, escaped) = self
                    .chars
                    .next()
                    .ok_or_else(|| anyhow!("unterminated escape sequence"))?;
                out.push(escaped);
                continue;
            }
            out.push(ch);
        }
        Err(anyhow!("unterminated string literal"))
    }
}
