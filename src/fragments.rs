//! Pure document-construction helpers: everything needed to turn a
//! resolver's current selection context into a new, self-contained query
//! document for a backend dispatch, without colliding with names the
//! caller's document already uses.

use std::collections::{BTreeMap, HashSet};

use graphql_parser::Pos;
use graphql_parser::query::{
    Definition, Document, Field, FragmentDefinition, Mutation, OperationDefinition, Query,
    Selection, SelectionSet, Value as AstValue, VariableDefinition,
};

use crate::error::ComposeError;
use crate::schema::{FragmentMap, JsonMap, TypeRef, VariableDefs};

pub type Sel = Selection<'static, String>;
pub type SelSet = SelectionSet<'static, String>;

/// A fully self-contained document plus its variable values, built for
/// exactly one backend dispatch. Never mutated after construction.
pub struct PendingQuery {
    pub document: Document<'static, String>,
    pub variables: JsonMap,
}

impl PendingQuery {
    pub fn text(&self) -> String {
        self.document.to_string()
    }
}

pub(crate) fn pos() -> Pos {
    Pos { line: 0, column: 0 }
}

pub fn empty_selection_set() -> SelSet {
    SelectionSet {
        span: (pos(), pos()),
        items: Vec::new(),
    }
}

pub fn response_key<'a>(field: &'a Field<'static, String>) -> &'a str {
    field.alias.as_deref().unwrap_or(&field.name)
}

/// First candidate not present in `taken`: `base`, then `base2`, `base3`, …
fn fresh_name(base: &str, taken: &HashSet<&str>) -> String {
    if !taken.contains(base) {
        return base.to_string();
    }
    let mut n = 2usize;
    loop {
        let candidate = format!("{}{}", base, n);
        if !taken.contains(candidate.as_str()) {
            return candidate;
        }
        n += 1;
    }
}

/// Adds a selection of `field_name` to a copy of `set` under an alias that
/// collides neither with any existing response key nor with the field's own
/// name. Returns the chosen alias and the augmented set; the original
/// selections are untouched.
pub fn add_field_selection(set: &SelSet, field_name: &str) -> (String, SelSet) {
    let mut taken: HashSet<&str> = set
        .items
        .iter()
        .filter_map(|sel| match sel {
            Selection::Field(f) => Some(response_key(f)),
            _ => None,
        })
        .collect();
    taken.insert(field_name);

    let alias = fresh_name(&format!("_{}", field_name), &taken);
    let mut augmented = set.clone();
    augmented.items.push(Selection::Field(Field {
        position: pos(),
        alias: Some(alias.clone()),
        name: field_name.to_string(),
        arguments: Vec::new(),
        directives: Vec::new(),
        selection_set: empty_selection_set(),
    }));
    (alias, augmented)
}

/// Adds a variable declaration named after `base` (renamed on collision) to
/// a copy of `defs`. Returns the chosen name and the augmented list.
pub fn add_variable_definition(
    defs: &VariableDefs,
    base: &str,
    var_type: TypeRef,
) -> (String, VariableDefs) {
    let taken: HashSet<&str> = defs.iter().map(|d| d.name.as_str()).collect();
    let name = fresh_name(base, &taken);
    let mut augmented = defs.clone();
    augmented.push(VariableDefinition {
        position: pos(),
        name: name.clone(),
        var_type,
        default_value: None,
    });
    (name, augmented)
}

/// Right-folds a dotted argument path into nested object-literal argument
/// syntax: path `a.b.c` with variable `v` becomes the argument
/// `a: {b: {c: $v}}`, returned as the head argument name plus its value.
pub fn nested_argument(
    path: &str,
    variable: &str,
    link: &str,
) -> Result<(String, AstValue<'static, String>), ComposeError> {
    let segments: Vec<&str> = path.split('.').filter(|s| !s.is_empty()).collect();
    let Some((head, rest)) = segments.split_first() else {
        return Err(ComposeError::EmptyArgumentPath {
            link: link.to_string(),
        });
    };
    Ok(fold_argument_path(head, rest, variable))
}

/// The infallible tail of [`nested_argument`], for callers that already
/// hold a validated, split path.
pub fn fold_argument_path<S: AsRef<str>>(
    head: &str,
    rest: &[S],
    variable: &str,
) -> (String, AstValue<'static, String>) {
    let mut value = AstValue::Variable(variable.to_string());
    for segment in rest.iter().rev() {
        let mut object = BTreeMap::new();
        object.insert(segment.as_ref().to_string(), value);
        value = AstValue::Object(object);
    }
    (head.to_string(), value)
}

/// Fragment definitions referenced (transitively) by a selection set, in
/// first-reference order.
pub fn collect_fragments(
    set: &SelSet,
    all: &FragmentMap,
) -> Vec<FragmentDefinition<'static, String>> {
    let mut seen: HashSet<String> = HashSet::new();
    let mut ordered: Vec<FragmentDefinition<'static, String>> = Vec::new();
    collect_fragments_into(set, all, &mut seen, &mut ordered);
    ordered
}

fn collect_fragments_into(
    set: &SelSet,
    all: &FragmentMap,
    seen: &mut HashSet<String>,
    ordered: &mut Vec<FragmentDefinition<'static, String>>,
) {
    for sel in &set.items {
        match sel {
            Selection::Field(f) => collect_fragments_into(&f.selection_set, all, seen, ordered),
            Selection::InlineFragment(frag) => {
                collect_fragments_into(&frag.selection_set, all, seen, ordered)
            }
            Selection::FragmentSpread(spread) => {
                if seen.insert(spread.fragment_name.clone()) {
                    if let Some(def) = all.get(&spread.fragment_name) {
                        ordered.push(def.clone());
                        collect_fragments_into(&def.selection_set, all, seen, ordered);
                    }
                }
            }
        }
    }
}

/// Names of all variables referenced by a selection set, including through
/// fragment spreads and inside nested argument values and directives.
pub fn collect_variables(set: &SelSet, fragments: &FragmentMap) -> HashSet<String> {
    let mut used = HashSet::new();
    let mut visited = HashSet::new();
    collect_variables_into(set, fragments, &mut visited, &mut used);
    used
}

fn collect_variables_into(
    set: &SelSet,
    fragments: &FragmentMap,
    visited: &mut HashSet<String>,
    used: &mut HashSet<String>,
) {
    for sel in &set.items {
        match sel {
            Selection::Field(f) => {
                for (_, value) in &f.arguments {
                    value_variables(value, used);
                }
                directive_variables(&f.directives, used);
                collect_variables_into(&f.selection_set, fragments, visited, used);
            }
            Selection::InlineFragment(frag) => {
                directive_variables(&frag.directives, used);
                collect_variables_into(&frag.selection_set, fragments, visited, used);
            }
            Selection::FragmentSpread(spread) => {
                directive_variables(&spread.directives, used);
                if visited.insert(spread.fragment_name.clone()) {
                    if let Some(def) = fragments.get(&spread.fragment_name) {
                        directive_variables(&def.directives, used);
                        collect_variables_into(&def.selection_set, fragments, visited, used);
                    }
                }
            }
        }
    }
}

fn directive_variables(
    directives: &[graphql_parser::query::Directive<'static, String>],
    used: &mut HashSet<String>,
) {
    for directive in directives {
        for (_, value) in &directive.arguments {
            value_variables(value, used);
        }
    }
}

fn value_variables(value: &AstValue<'static, String>, used: &mut HashSet<String>) {
    match value {
        AstValue::Variable(name) => {
            used.insert(name.clone());
        }
        AstValue::List(items) => {
            for item in items {
                value_variables(item, used);
            }
        }
        AstValue::Object(fields) => {
            for item in fields.values() {
                value_variables(item, used);
            }
        }
        _ => {}
    }
}

pub fn filter_variable_definitions(defs: &VariableDefs, used: &HashSet<String>) -> VariableDefs {
    defs.iter().filter(|d| used.contains(&d.name)).cloned().collect()
}

pub fn filter_variable_values(values: &JsonMap, used: &HashSet<String>) -> JsonMap {
    values
        .iter()
        .filter(|(name, _)| used.contains(name.as_str()))
        .map(|(name, value)| (name.clone(), value.clone()))
        .collect()
}

/// Assembles a complete executable query document from its parts.
pub fn build_query(
    selection_set: SelSet,
    variable_definitions: VariableDefs,
    fragments: Vec<FragmentDefinition<'static, String>>,
    variables: JsonMap,
) -> PendingQuery {
    let operation = OperationDefinition::Query(Query {
        position: pos(),
        name: None,
        variable_definitions,
        directives: Vec::new(),
        selection_set,
    });
    assemble(operation, fragments, variables)
}

/// Like [`build_query`] but emits a mutation operation.
pub fn build_mutation(
    selection_set: SelSet,
    variable_definitions: VariableDefs,
    fragments: Vec<FragmentDefinition<'static, String>>,
    variables: JsonMap,
) -> PendingQuery {
    let operation = OperationDefinition::Mutation(Mutation {
        position: pos(),
        name: None,
        variable_definitions,
        directives: Vec::new(),
        selection_set,
    });
    assemble(operation, fragments, variables)
}

fn assemble(
    operation: OperationDefinition<'static, String>,
    fragments: Vec<FragmentDefinition<'static, String>>,
    variables: JsonMap,
) -> PendingQuery {
    let mut definitions = vec![Definition::Operation(operation)];
    definitions.extend(fragments.into_iter().map(Definition::Fragment));
    PendingQuery {
        document: Document { definitions },
        variables,
    }
}
