//! `eng/Version.Details.xml`: the dependencies a repository consumes and
//! the VMR commit it was last backflowed from.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};
use xot::{NameId, Node, Xot};

use super::VERSION_DETAILS_XML;
use crate::errors::VersionFileError;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DependencyType {
    Product,
    Toolset,
}

/// One `<Dependency>` entry.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DependencyDetail {
    pub name: String,
    pub version: String,
    pub repo_uri: String,
    pub commit: String,
    #[serde(default)]
    pub pinned: bool,
    #[serde(default)]
    pub skip_property: bool,
    #[serde(default)]
    pub coherent_parent_dependency: Option<String>,
    pub dependency_type: DependencyType,
}

impl DependencyDetail {
    /// Whether version, commit or repository differ.
    pub fn differs_from(&self, other: &DependencyDetail) -> bool {
        self.version != other.version || self.commit != other.commit || self.repo_uri != other.repo_uri
    }
}

/// The `<Source>` element written by backflows.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SourceDependency {
    pub uri: String,
    pub mapping: String,
    pub sha: String,
    pub bar_id: Option<u64>,
}

/// A dependency moving between two states. `from: None` is an addition,
/// `to: None` a removal.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DependencyUpdate {
    pub from: Option<DependencyDetail>,
    pub to: Option<DependencyDetail>,
}

impl DependencyUpdate {
    pub fn name(&self) -> &str {
        self.to
            .as_ref()
            .or(self.from.as_ref())
            .map(|d| d.name.as_str())
            .unwrap_or_default()
    }

    pub fn is_addition(&self) -> bool {
        self.from.is_none() && self.to.is_some()
    }

    pub fn is_removal(&self) -> bool {
        self.from.is_some() && self.to.is_none()
    }

    pub fn is_update(&self) -> bool {
        self.from.is_some() && self.to.is_some()
    }

    /// Short description used in logs and conflict errors.
    pub fn describe(&self) -> String {
        match (&self.from, &self.to) {
            (None, Some(to)) => format!("added {}", to.version),
            (Some(from), None) => format!("removed {}", from.version),
            (Some(from), Some(to)) => format!("updated {} to {}", from.version, to.version),
            (None, None) => "unchanged".to_string(),
        }
    }
}

/// Parsed content of a `Version.Details.xml` file.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct VersionDetails {
    pub dependencies: Vec<DependencyDetail>,
    pub source: Option<SourceDependency>,
}

/// New dependency files start from this layout.
const EMPTY_FILE: &str = "<?xml version=\"1.0\" encoding=\"utf-8\"?>
<Dependencies>
  <ProductDependencies>
  </ProductDependencies>
  <ToolsetDependencies>
  </ToolsetDependencies>
</Dependencies>
";

const SECTION_INDENT: &str = "\n  ";
const DEPENDENCY_INDENT: &str = "\n    ";
const CHILD_INDENT: &str = "\n      ";

struct Names {
    dependencies: NameId,
    product: NameId,
    toolset: NameId,
    dependency: NameId,
    source: NameId,
    uri: NameId,
    sha: NameId,
    name: NameId,
}

impl Names {
    fn new(xot: &mut Xot) -> Self {
        Self {
            dependencies: xot.add_name("Dependencies"),
            product: xot.add_name("ProductDependencies"),
            toolset: xot.add_name("ToolsetDependencies"),
            dependency: xot.add_name("Dependency"),
            source: xot.add_name("Source"),
            uri: xot.add_name("Uri"),
            sha: xot.add_name("Sha"),
            name: xot.add_name("Name"),
        }
    }

    fn section(&self, dependency_type: DependencyType) -> NameId {
        match dependency_type {
            DependencyType::Product => self.product,
            DependencyType::Toolset => self.toolset,
        }
    }
}

/// A parsed file kept as a document so it can be written back with only
/// the touched nodes changed.
struct Document {
    xot: Xot,
    document: Node,
    root: Node,
    names: Names,
    file: String,
}

impl Document {
    fn parse(content: &str, file: &str) -> Result<Self, VersionFileError> {
        let mut xot = Xot::new();
        let document = xot.parse(content).map_err(|e| xml_error(file, e.to_string()))?;
        let root = xot
            .document_element(document)
            .map_err(|e| xml_error(file, e.to_string()))?;
        let names = Names::new(&mut xot);
        if element_name(&xot, root) != Some(names.dependencies) {
            return Err(xml_error(file, "root element must be <Dependencies>".into()));
        }
        Ok(Self {
            xot,
            document,
            root,
            names,
            file: file.to_string(),
        })
    }

    fn child_elements(&self, node: Node) -> Vec<Node> {
        self.xot.children(node).filter(|n| self.xot.is_element(*n)).collect()
    }

    fn child_element(&self, node: Node, name: NameId) -> Option<Node> {
        self.xot
            .children(node)
            .find(|n| element_name(&self.xot, *n) == Some(name))
    }

    /// `<Dependency>` elements with their section, in document order.
    fn dependency_nodes(&self) -> Vec<(Node, DependencyType)> {
        let mut nodes = Vec::new();
        for section in self.child_elements(self.root) {
            let dependency_type = match element_name(&self.xot, section) {
                Some(n) if n == self.names.product => DependencyType::Product,
                Some(n) if n == self.names.toolset => DependencyType::Toolset,
                _ => continue,
            };
            for entry in self.child_elements(section) {
                if element_name(&self.xot, entry) == Some(self.names.dependency) {
                    nodes.push((entry, dependency_type));
                }
            }
        }
        nodes
    }

    fn read(&mut self) -> Result<VersionDetails, VersionFileError> {
        let mut details = VersionDetails::default();
        for child in self.child_elements(self.root) {
            if element_name(&self.xot, child) == Some(self.names.source) {
                details.source = Some(parse_source(&mut self.xot, child)?);
            } else if element_name(&self.xot, child) == Some(self.names.dependency) {
                return Err(xml_error(
                    &self.file,
                    "<Dependency> must be placed under <ProductDependencies> or <ToolsetDependencies>".into(),
                ));
            }
        }
        for (node, dependency_type) in self.dependency_nodes() {
            details
                .dependencies
                .push(parse_dependency(&mut self.xot, &self.names, node, dependency_type)?);
        }
        Ok(details)
    }

    fn error(&self, e: xot::Error) -> VersionFileError {
        xml_error(&self.file, e.to_string())
    }

    /// Put `node` last among the element children of `parent`, on its own
    /// line indented by `indent`.
    fn append_indented(&mut self, parent: Node, node: Node, indent: &str) -> Result<(), VersionFileError> {
        let closing = self
            .xot
            .last_child(parent)
            .filter(|n| self.xot.text_str(*n).is_some_and(|t| t.trim().is_empty()));
        match closing {
            Some(closing) => {
                self.xot.insert_before(closing, node).map_err(|e| self.error(e))?;
                let text = self.xot.new_text(indent);
                self.xot.insert_before(node, text).map_err(|e| self.error(e))?;
            }
            None => {
                let parent_indent = &indent[..indent.len().saturating_sub(2)];
                self.xot.append_text(parent, indent).map_err(|e| self.error(e))?;
                self.xot.append(parent, node).map_err(|e| self.error(e))?;
                self.xot.append_text(parent, parent_indent).map_err(|e| self.error(e))?;
            }
        }
        Ok(())
    }

    /// Detach `node` along with the whitespace that indents it.
    fn remove_indented(&mut self, node: Node) -> Result<(), VersionFileError> {
        if let Some(indent) = self
            .xot
            .previous_sibling(node)
            .filter(|n| self.xot.text_str(*n).is_some_and(|t| t.trim().is_empty()))
        {
            self.xot.remove(indent).map_err(|e| self.error(e))?;
        }
        self.xot.remove(node).map_err(|e| self.error(e))
    }

    fn set_attribute(&mut self, node: Node, name: &str, value: Option<&str>) {
        let id = self.xot.add_name(name);
        match value {
            Some(value) if self.xot.get_attribute(node, id) != Some(value) => self.xot.set_attribute(node, id, value),
            Some(_) => {}
            None => self.xot.remove_attribute(node, id),
        }
    }

    fn set_child_text(&mut self, node: Node, name: NameId, value: &str) -> Result<(), VersionFileError> {
        if let Some(child) = self.child_element(node, name) {
            if self.xot.text_content_str(child).map(str::trim) != Some(value) {
                if let Some(text) = self.xot.text_content_mut(child) {
                    text.set(value);
                } else {
                    return Err(xml_error(&self.file, "dependency children must only hold text".into()));
                }
            }
            return Ok(());
        }
        let child = self.xot.new_element(name);
        self.xot.append_text(child, value).map_err(|e| self.error(e))?;
        self.append_indented(node, child, CHILD_INDENT)
    }

    fn write_source(&mut self, source: Option<&SourceDependency>) -> Result<(), VersionFileError> {
        let existing = self.child_element(self.root, self.names.source);
        let Some(source) = source else {
            if let Some(node) = existing {
                self.remove_indented(node)?;
            }
            return Ok(());
        };

        let node = match existing {
            Some(node) => node,
            None => {
                let node = self.xot.new_element(self.names.source);
                match self.child_elements(self.root).first().copied() {
                    Some(first) => {
                        self.xot.insert_before(first, node).map_err(|e| self.error(e))?;
                        let text = self.xot.new_text(SECTION_INDENT);
                        self.xot.insert_before(first, text).map_err(|e| self.error(e))?;
                    }
                    None => self.append_indented(self.root, node, SECTION_INDENT)?,
                }
                node
            }
        };
        self.set_attribute(node, "Uri", Some(&source.uri));
        self.set_attribute(node, "Mapping", Some(&source.mapping));
        self.set_attribute(node, "Sha", Some(&source.sha));
        let bar_id = source.bar_id.map(|id| id.to_string());
        self.set_attribute(node, "BarId", bar_id.as_deref());
        Ok(())
    }

    fn section_node(&mut self, dependency_type: DependencyType) -> Result<Node, VersionFileError> {
        let name = self.names.section(dependency_type);
        if let Some(section) = self.child_element(self.root, name) {
            return Ok(section);
        }
        let section = self.xot.new_element(name);
        self.append_indented(self.root, section, SECTION_INDENT)?;
        Ok(section)
    }

    fn update_dependency(&mut self, node: Node, dependency: &DependencyDetail) -> Result<(), VersionFileError> {
        self.set_attribute(node, "Version", Some(&dependency.version));
        let current = parse_dependency(&mut self.xot, &self.names, node, dependency.dependency_type)?;
        if current.coherent_parent_dependency != dependency.coherent_parent_dependency {
            self.set_attribute(
                node,
                "CoherentParentDependency",
                dependency.coherent_parent_dependency.as_deref(),
            );
        }
        if current.pinned != dependency.pinned {
            self.set_attribute(node, "Pinned", dependency.pinned.then_some("true"));
        }
        if current.skip_property != dependency.skip_property {
            self.set_attribute(node, "SkipProperty", dependency.skip_property.then_some("true"));
        }
        self.set_child_text(node, self.names.uri, &dependency.repo_uri)?;
        self.set_child_text(node, self.names.sha, &dependency.commit)
    }

    fn add_dependency(&mut self, dependency: &DependencyDetail) -> Result<(), VersionFileError> {
        let section = self.section_node(dependency.dependency_type)?;
        let node = self.xot.new_element(self.names.dependency);
        self.set_attribute(node, "Name", Some(&dependency.name));
        self.set_attribute(node, "Version", Some(&dependency.version));
        self.set_attribute(
            node,
            "CoherentParentDependency",
            dependency.coherent_parent_dependency.as_deref(),
        );
        if dependency.pinned {
            self.set_attribute(node, "Pinned", Some("true"));
        }
        if dependency.skip_property {
            self.set_attribute(node, "SkipProperty", Some("true"));
        }
        self.set_child_text(node, self.names.uri, &dependency.repo_uri)?;
        self.set_child_text(node, self.names.sha, &dependency.commit)?;
        self.append_indented(section, node, DEPENDENCY_INDENT)
    }

    /// Make the document hold `details`.
    fn write(&mut self, details: &VersionDetails) -> Result<(), VersionFileError> {
        self.write_source(details.source.as_ref())?;

        let mut written: Vec<&str> = Vec::new();
        for (node, _) in self.dependency_nodes() {
            let name = self
                .xot
                .get_attribute(node, self.names.name)
                .unwrap_or_default()
                .to_string();
            match details.dependency(&name) {
                Some(dependency) => {
                    self.update_dependency(node, dependency)?;
                    written.push(dependency.name.as_str());
                }
                None => self.remove_indented(node)?,
            }
        }
        for dependency in &details.dependencies {
            if !written.iter().any(|w| w.eq_ignore_ascii_case(&dependency.name)) {
                self.add_dependency(dependency)?;
                written.push(dependency.name.as_str());
            }
        }
        Ok(())
    }

    /// Serialize, keeping the XML declaration and final newline of `original`.
    fn serialize(&self, original: &str) -> Result<String, VersionFileError> {
        let body = self.xot.to_string(self.document).map_err(|e| self.error(e))?;
        let mut out = String::with_capacity(original.len().max(body.len()) + 64);
        let trimmed = original.trim_start_matches('\u{feff}');
        if trimmed.starts_with("<?xml") {
            if let Some(end) = trimmed.find("?>") {
                out.push_str(&trimmed[..end + 2]);
                out.push('\n');
            }
        }
        out.push_str(&body);
        if original.ends_with('\n') && !out.ends_with('\n') {
            out.push('\n');
        }
        Ok(out)
    }
}

impl VersionDetails {
    /// Parse a file. `file` is only used in error messages.
    pub fn parse(content: &str, file: &str) -> Result<Self, VersionFileError> {
        Document::parse(content, file)?.read()
    }

    /// Dependency of the given name, compared case-insensitively.
    pub fn dependency(&self, name: &str) -> Option<&DependencyDetail> {
        self.dependencies
            .iter()
            .find(|d| d.name.eq_ignore_ascii_case(name))
    }

    /// Replace the version, commit and repository of an existing dependency
    /// or append a new one.
    pub fn upsert(&mut self, dependency: DependencyDetail) {
        match self
            .dependencies
            .iter_mut()
            .find(|d| d.name.eq_ignore_ascii_case(&dependency.name))
        {
            Some(existing) => {
                existing.version = dependency.version;
                existing.commit = dependency.commit;
                existing.repo_uri = dependency.repo_uri;
            }
            None => self.dependencies.push(dependency),
        }
    }

    pub fn remove(&mut self, name: &str) -> bool {
        let before = self.dependencies.len();
        self.dependencies.retain(|d| !d.name.eq_ignore_ascii_case(name));
        before != self.dependencies.len()
    }

    /// Dependencies keyed by name, leaving out `excluded` names and, unless
    /// `include_pinned`, pinned dependencies.
    pub fn to_map(&self, excluded: &[String], include_pinned: bool) -> BTreeMap<String, DependencyDetail> {
        self.dependencies
            .iter()
            .filter(|d| include_pinned || !d.pinned)
            .filter(|d| !excluded.iter().any(|e| e.eq_ignore_ascii_case(&d.name)))
            .map(|d| (d.name.clone(), d.clone()))
            .collect()
    }

    /// Serialize into a new file.
    pub fn to_xml(&self) -> Result<String, VersionFileError> {
        self.write_over(EMPTY_FILE, VERSION_DETAILS_XML)
    }

    /// Serialize over the `original` content of `file`. Only the `Source`
    /// element and the dependencies that changed are rewritten; comments,
    /// formatting and unknown elements stay as they are.
    pub fn write_over(&self, original: &str, file: &str) -> Result<String, VersionFileError> {
        let mut document = Document::parse(original, file)?;
        document.write(self)?;
        document.serialize(original)
    }
}

fn element_name(xot: &Xot, node: Node) -> Option<NameId> {
    xot.element(node).map(|e| e.name())
}

fn parse_source(xot: &mut Xot, node: Node) -> Result<SourceDependency, VersionFileError> {
    let uri = required_attribute(xot, node, "Source", "Uri")?;
    let sha = required_attribute(xot, node, "Source", "Sha")?;
    let mapping = required_attribute(xot, node, "Source", "Mapping")?;
    // A malformed build id only loses the link to the build.
    let bar_id = attribute(xot, node, "BarId").and_then(|v| v.trim().parse::<u64>().ok());
    Ok(SourceDependency {
        uri,
        mapping,
        sha,
        bar_id,
    })
}

fn parse_dependency(
    xot: &mut Xot,
    names: &Names,
    node: Node,
    dependency_type: DependencyType,
) -> Result<DependencyDetail, VersionFileError> {
    let name = required_attribute(xot, node, "Dependency", "Name")?;
    let version = required_attribute(xot, node, "Dependency", "Version")?;
    let pinned = bool_attribute(xot, node, "Pinned")?;
    let skip_property = bool_attribute(xot, node, "SkipProperty")?;
    let coherent_parent_dependency = attribute(xot, node, "CoherentParentDependency");

    let mut repo_uri = String::new();
    let mut commit = String::new();
    let children: Vec<Node> = xot.children(node).filter(|n| xot.is_element(*n)).collect();
    for child in children {
        let text = xot.text_content_str(child).unwrap_or_default().trim().to_string();
        match element_name(xot, child) {
            Some(n) if n == names.uri => repo_uri = text,
            Some(n) if n == names.sha => commit = text,
            _ => {}
        }
    }

    Ok(DependencyDetail {
        name,
        version,
        repo_uri,
        commit,
        pinned,
        skip_property,
        coherent_parent_dependency,
        dependency_type,
    })
}

fn attribute(xot: &mut Xot, node: Node, name: &str) -> Option<String> {
    let id = xot.add_name(name);
    xot.get_attribute(node, id).map(str::to_string)
}

fn required_attribute(xot: &mut Xot, node: Node, element: &str, name: &str) -> Result<String, VersionFileError> {
    attribute(xot, node, name).ok_or_else(|| VersionFileError::MissingAttribute {
        element: element.to_string(),
        attribute: name.to_string(),
    })
}

fn bool_attribute(xot: &mut Xot, node: Node, name: &str) -> Result<bool, VersionFileError> {
    match attribute(xot, node, name) {
        None => Ok(false),
        Some(value) if value.eq_ignore_ascii_case("true") => Ok(true),
        Some(value) if value.eq_ignore_ascii_case("false") => Ok(false),
        Some(value) => Err(VersionFileError::InvalidAttribute {
            element: "Dependency".into(),
            attribute: name.to_string(),
            value,
        }),
    }
}

fn xml_error(file: &str, detail: String) -> VersionFileError {
    VersionFileError::XmlParse {
        file: file.to_string(),
        detail,
    }
}
