// Instrument definition (`.linst`) parsing
//
// The format is line oriented: one declaration per line, sub-fields separated by `{@}`.
// `select` lines carry their options in sub-field 3 as `key=>label` entries separated by `{-}`.
//
// Parsing is a pure function of the file contents; file I/O lives in `parse_file`.

use std::collections::HashSet;
use std::path::Path;

use serde::Serialize;
use thiserror::Error;

pub const FIELD_SEPARATOR: &str = "{@}";
pub const OPTION_SEPARATOR: &str = "{-}";
pub const OPTION_KEY_SEPARATOR: &str = "=>";
/// Enum key that never becomes part of the database enum type.
pub const NULL_OPTION_KEY: &str = "NULL";
/// Framework-managed field that has no column of its own.
pub const RESERVED_EXAMINER_FIELD: &str = "Examiner";
pub const DEFINITION_EXTENSION: &str = "linst";

#[derive(Debug, Error)]
pub enum DefinitionError {
    #[error("definition file not found: {0}")]
    NotFound(String),
    #[error("failed to read definition file {path}")]
    Io {
        path: String,
        #[source]
        source: std::io::Error,
    },
}

/// Field kinds that participate in schema validation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum FieldType {
    Text,
    TextArea,
    Select,
    SelectMultiple,
    Date,
}

impl FieldType {
    pub fn from_keyword(keyword: &str) -> Option<Self> {
        match keyword {
            "text" => Some(FieldType::Text),
            "textarea" => Some(FieldType::TextArea),
            "select" => Some(FieldType::Select),
            "selectmultiple" => Some(FieldType::SelectMultiple),
            "date" => Some(FieldType::Date),
            _ => None,
        }
    }

    pub fn keyword(&self) -> &'static str {
        match self {
            FieldType::Text => "text",
            FieldType::TextArea => "textarea",
            FieldType::Select => "select",
            FieldType::SelectMultiple => "selectmultiple",
            FieldType::Date => "date",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct EnumOption {
    pub key: String,
    pub label: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Field {
    pub field_type: FieldType,
    pub name: String,
    /// Title of the page this field appears on (`None` before the first page).
    pub page_title: Option<String>,
    /// Present iff `field_type == Select`.
    pub enum_options: Option<Vec<EnumOption>>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "kind", rename_all = "lowercase")]
pub enum Declaration {
    Page { name: String, title: String },
    Title { text: String },
    Field(Field),
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Definition {
    pub declarations: Vec<Declaration>,
    /// Value of the `table{@}<name>` directive, if any.
    pub table_name: Option<String>,
}

impl Definition {
    pub fn fields(&self) -> impl Iterator<Item = &Field> {
        self.declarations.iter().filter_map(|d| match d {
            Declaration::Field(f) => Some(f),
            _ => None,
        })
    }

    /// Page titles in declaration order.
    pub fn page_titles(&self) -> impl Iterator<Item = &str> {
        self.declarations.iter().filter_map(|d| match d {
            Declaration::Page { title, .. } => Some(title.as_str()),
            _ => None,
        })
    }

    /// Field names declared more than once, in order of their second appearance.
    pub fn duplicate_field_names(&self) -> Vec<String> {
        let mut seen = HashSet::new();
        let mut dupes = Vec::new();
        for field in self.fields() {
            if !seen.insert(field.name.as_str()) && !dupes.contains(&field.name) {
                dupes.push(field.name.clone());
            }
        }
        dupes
    }
}

impl Field {
    /// Option keys that make up the database enum, in declared order.
    pub fn enum_keys(&self) -> Vec<&str> {
        self.enum_options
            .iter()
            .flatten()
            .map(|o| o.key.as_str())
            .filter(|k| *k != NULL_OPTION_KEY)
            .collect()
    }

    /// `enum(<keys>)` as MySQL stores it in `COLUMN_TYPE`.
    pub fn expected_enum_signature(&self) -> String {
        format!("enum({})", self.enum_keys().join(","))
    }
}

fn parse_options(raw: &str) -> Vec<EnumOption> {
    raw.split(OPTION_SEPARATOR)
        .map(|entry| match entry.split_once(OPTION_KEY_SEPARATOR) {
            Some((key, label)) => EnumOption {
                key: key.to_string(),
                label: label.to_string(),
            },
            None => EnumOption {
                key: entry.to_string(),
                label: String::new(),
            },
        })
        .collect()
}

/// Parse definition text into declarations.
///
/// Unknown keywords (including `table`) yield no declaration, and neither does anything named `Examiner`.
pub fn parse_definition(contents: &str) -> Definition {
    let mut definition = Definition::default();
    let mut current_page: Option<String> = None;

    for line in contents.lines() {
        let pieces: Vec<&str> = line.split(FIELD_SEPARATOR).collect();
        if pieces.len() < 2 {
            continue;
        }
        let (keyword, name) = (pieces[0], pieces[1]);

        if keyword == "table" {
            definition.table_name = Some(name.trim().to_string());
            continue;
        }
        if name == RESERVED_EXAMINER_FIELD {
            continue;
        }

        match keyword {
            "page" => {
                let title = pieces.get(2).map(|t| t.trim()).unwrap_or("").to_string();
                current_page = Some(title.clone());
                definition.declarations.push(Declaration::Page {
                    name: name.to_string(),
                    title,
                });
            }
            "title" => definition.declarations.push(Declaration::Title {
                text: name.to_string(),
            }),
            other => {
                let Some(field_type) = FieldType::from_keyword(other) else {
                    continue;
                };
                let enum_options = (field_type == FieldType::Select)
                    .then(|| pieces.get(3).map(|raw| parse_options(raw)).unwrap_or_default());
                definition.declarations.push(Declaration::Field(Field {
                    field_type,
                    name: name.to_string(),
                    page_title: current_page.clone(),
                    enum_options,
                }));
            }
        }
    }

    definition
}

/// Read and parse a definition file.
pub async fn parse_file(path: &Path) -> Result<Definition, DefinitionError> {
    let bytes = match tokio::fs::read(path).await {
        Ok(b) => b,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
            return Err(DefinitionError::NotFound(path.display().to_string()));
        }
        Err(source) => {
            return Err(DefinitionError::Io {
                path: path.display().to_string(),
                source,
            });
        }
    };

    Ok(parse_definition(&String::from_utf8_lossy(&bytes)))
}

/// Path of the definition file for `instrument` under `instruments_dir`.
pub fn definition_path(instruments_dir: &Path, instrument: &str) -> std::path::PathBuf {
    instruments_dir.join(format!("{}.{}", instrument, DEFINITION_EXTENSION))
}
