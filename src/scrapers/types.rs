use serde::{Deserialize, Serialize};
use std::fmt;

/// Opaque reference to an element located on the live page
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ElementHandle(pub String);

impl ElementHandle {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    pub fn id(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for ElementHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "#{}", self.0)
    }
}

/// Viewport rectangle of an element
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct BoundingBox {
    pub x: f64,
    pub y: f64,
    pub width: f64,
    pub height: f64,
}

impl BoundingBox {
    /// Point just inside the trailing edge, where dropdown arrows usually sit
    pub fn trailing_edge(&self) -> (f64, f64) {
        (self.x + self.width - 8.0, self.y + self.height / 2.0)
    }
}

/// File the browser finished downloading
#[derive(Debug, Clone)]
pub struct RawDownload {
    pub suggested_name: String,
    pub bytes: Vec<u8>,
}

/// How to find an element. Drivers only ever return visible matches.
#[derive(Debug, Clone, PartialEq)]
pub enum Locator {
    /// Plain CSS selector
    Css(String),
    /// Elements under `selector` whose trimmed text equals `text`
    ExactText { selector: String, text: String },
    /// Elements under `selector` whose text contains `text`, ignoring case
    ContainsText { selector: String, text: String },
    /// Elements under `selector` whose text matches `pattern`, ignoring case
    TextPattern { selector: String, pattern: String },
    /// ARIA role (explicit or implied by the tag) with an exact accessible name
    Role { role: String, name: String },
    /// Interactive elements inside `scope` whose text contains `text`
    Scoped { scope: String, text: String },
    /// `inner` evaluated below an already located element
    Within {
        parent: ElementHandle,
        inner: Box<Locator>,
    },
}

impl Locator {
    pub fn css(selector: impl Into<String>) -> Self {
        Locator::Css(selector.into())
    }

    pub fn exact_text(selector: impl Into<String>, text: impl Into<String>) -> Self {
        Locator::ExactText {
            selector: selector.into(),
            text: text.into(),
        }
    }

    pub fn contains_text(selector: impl Into<String>, text: impl Into<String>) -> Self {
        Locator::ContainsText {
            selector: selector.into(),
            text: text.into(),
        }
    }

    pub fn pattern(selector: impl Into<String>, pattern: impl Into<String>) -> Self {
        Locator::TextPattern {
            selector: selector.into(),
            pattern: pattern.into(),
        }
    }

    pub fn role(role: impl Into<String>, name: impl Into<String>) -> Self {
        Locator::Role {
            role: role.into(),
            name: name.into(),
        }
    }

    pub fn scoped(scope: impl Into<String>, text: impl Into<String>) -> Self {
        Locator::Scoped {
            scope: scope.into(),
            text: text.into(),
        }
    }

    pub fn within(parent: &ElementHandle, inner: Locator) -> Self {
        Locator::Within {
            parent: parent.clone(),
            inner: Box::new(inner),
        }
    }

    /// Flatten into the query shape drivers evaluate against the DOM
    pub fn to_query(&self) -> DomQuery {
        match self {
            Locator::Css(selector) => DomQuery::selector(selector),
            Locator::ExactText { selector, text } => DomQuery {
                exact: Some(text.clone()),
                ..DomQuery::selector(selector)
            },
            Locator::ContainsText { selector, text } => DomQuery {
                contains: Some(text.clone()),
                ..DomQuery::selector(selector)
            },
            Locator::TextPattern { selector, pattern } => DomQuery {
                pattern: Some(pattern.clone()),
                ..DomQuery::selector(selector)
            },
            Locator::Role { role, name } => DomQuery {
                exact: Some(name.clone()),
                ..DomQuery::selector(&role_selector(role))
            },
            Locator::Scoped { scope, text } => DomQuery {
                scope: Some(scope.clone()),
                contains: Some(text.clone()),
                ..DomQuery::selector(SCOPED_TARGETS)
            },
            Locator::Within { parent, inner } => DomQuery {
                parent: Some(parent.id().to_string()),
                ..inner.to_query()
            },
        }
    }
}

impl fmt::Display for Locator {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Locator::Css(selector) => write!(f, "css({})", selector),
            Locator::ExactText { selector, text } => write!(f, "text({} = {:?})", selector, text),
            Locator::ContainsText { selector, text } => {
                write!(f, "text({} ~ {:?})", selector, text)
            }
            Locator::TextPattern { selector, pattern } => {
                write!(f, "pattern({} /{}/i)", selector, pattern)
            }
            Locator::Role { role, name } => write!(f, "role({} {:?})", role, name),
            Locator::Scoped { scope, text } => write!(f, "scoped({} ~ {:?})", scope, text),
            Locator::Within { parent, inner } => write!(f, "{} > {}", parent, inner),
        }
    }
}

const SCOPED_TARGETS: &str = "a, button, [role='link'], [role='menuitem'], [role='button'], li";

fn role_selector(role: &str) -> String {
    match role {
        "link" => "a, [role='link']".to_string(),
        "button" => {
            "button, [role='button'], input[type='submit'], input[type='button']".to_string()
        }
        "heading" => "h1, h2, h3, h4, h5, h6, [role='heading']".to_string(),
        "textbox" => "input:not([type]), input[type='text'], input[type='email'], textarea, [role='textbox']"
            .to_string(),
        "option" => "option, [role='option']".to_string(),
        other => format!("[role='{}']", other),
    }
}

/// Serialized form of a [`Locator`] handed to the page script
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct DomQuery {
    pub selector: String,
    pub parent: Option<String>,
    pub scope: Option<String>,
    pub exact: Option<String>,
    pub contains: Option<String>,
    pub pattern: Option<String>,
}

impl DomQuery {
    fn selector(selector: &str) -> Self {
        Self {
            selector: selector.to_string(),
            ..Default::default()
        }
    }
}
