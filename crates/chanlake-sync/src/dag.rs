//! Transform DAG: named steps, each a pure function from its declared input
//! relations to one output relation, executed in dependency order.

use std::collections::{BTreeMap, BTreeSet};

use anyhow::{anyhow, bail, Result};
use chanlake_core::{
    relations, DimChannel, DimDate, FactDetection, FactMessage, RawDetection, RawRecord,
    StagedDetection, StagedMessage, Table,
};
use serde::Serialize;
use tracing::debug;

use crate::marts::{
    build_dim_channels, build_dim_dates, build_fct_detections, build_fct_messages,
    TransformContext,
};
use crate::staging::{stage_detections, stage_messages, CoercionCounts};

#[derive(Debug, Clone, PartialEq)]
pub enum Relation {
    RawMessages(Vec<RawRecord>),
    RawDetections(Vec<RawDetection>),
    StagedMessages(Vec<StagedMessage>),
    StagedDetections(Vec<StagedDetection>),
    DimChannels(Vec<DimChannel>),
    DimDates(Vec<DimDate>),
    FactMessages(Vec<FactMessage>),
    FactDetections(Vec<FactDetection>),
}

impl Relation {
    pub fn len(&self) -> usize {
        match self {
            Relation::RawMessages(rows) => rows.len(),
            Relation::RawDetections(rows) => rows.len(),
            Relation::StagedMessages(rows) => rows.len(),
            Relation::StagedDetections(rows) => rows.len(),
            Relation::DimChannels(rows) => rows.len(),
            Relation::DimDates(rows) => rows.len(),
            Relation::FactMessages(rows) => rows.len(),
            Relation::FactDetections(rows) => rows.len(),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Materializable form. Raw relations are owned by the loader and never
    /// written back by the DAG.
    pub fn to_table(&self) -> Option<Table> {
        match self {
            Relation::RawMessages(_) | Relation::RawDetections(_) => None,
            Relation::StagedMessages(rows) => Some(Table::from_rows(rows)),
            Relation::StagedDetections(rows) => Some(Table::from_rows(rows)),
            Relation::DimChannels(rows) => Some(Table::from_rows(rows)),
            Relation::DimDates(rows) => Some(Table::from_rows(rows)),
            Relation::FactMessages(rows) => Some(Table::from_rows(rows)),
            Relation::FactDetections(rows) => Some(Table::from_rows(rows)),
        }
    }
}

/// Relations available to steps, keyed by relation name.
#[derive(Debug, Default)]
pub struct Catalog {
    relations: BTreeMap<String, Relation>,
}

macro_rules! catalog_getter {
    ($fn:ident, $variant:ident, $row:ty) => {
        pub fn $fn(&self, name: &str) -> Result<&[$row]> {
            match self.relations.get(name) {
                Some(Relation::$variant(rows)) => Ok(rows),
                Some(_) => Err(anyhow!("relation `{name}` has an unexpected shape")),
                None => Err(anyhow!("relation `{name}` is not in the catalog")),
            }
        }
    };
}

impl Catalog {
    pub fn with_sources(raw_messages: Vec<RawRecord>, raw_detections: Vec<RawDetection>) -> Self {
        let mut catalog = Self::default();
        catalog.insert(relations::RAW_MESSAGES, Relation::RawMessages(raw_messages));
        catalog.insert(
            relations::RAW_IMAGE_DETECTIONS,
            Relation::RawDetections(raw_detections),
        );
        catalog
    }

    pub fn insert(&mut self, name: &str, relation: Relation) {
        self.relations.insert(name.to_string(), relation);
    }

    pub fn contains(&self, name: &str) -> bool {
        self.relations.contains_key(name)
    }

    pub fn get(&self, name: &str) -> Option<&Relation> {
        self.relations.get(name)
    }

    catalog_getter!(raw_messages, RawMessages, RawRecord);
    catalog_getter!(raw_detections, RawDetections, RawDetection);
    catalog_getter!(staged_messages, StagedMessages, StagedMessage);
    catalog_getter!(staged_detections, StagedDetections, StagedDetection);
    catalog_getter!(dim_dates, DimDates, DimDate);
    catalog_getter!(fct_messages, FactMessages, FactMessage);
}

pub struct StepOutput {
    pub relation: Relation,
    pub coercion_failures: CoercionCounts,
}

impl From<Relation> for StepOutput {
    fn from(relation: Relation) -> Self {
        Self {
            relation,
            coercion_failures: CoercionCounts::default(),
        }
    }
}

pub type StepFn = fn(&Catalog, &TransformContext) -> Result<StepOutput>;

#[derive(Clone)]
pub struct TransformStep {
    pub name: &'static str,
    pub inputs: &'static [&'static str],
    pub build: StepFn,
}

impl std::fmt::Debug for TransformStep {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TransformStep")
            .field("name", &self.name)
            .field("inputs", &self.inputs)
            .finish()
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct StepReport {
    pub relation: String,
    pub rows: usize,
    pub coercion_failures: CoercionCounts,
}

#[derive(Debug, Clone)]
pub struct TransformDag {
    steps: Vec<TransformStep>,
}

impl TransformDag {
    pub fn new(steps: Vec<TransformStep>) -> Self {
        Self { steps }
    }

    /// Staging and mart steps of the channel warehouse.
    pub fn standard() -> Self {
        Self::new(vec![
            TransformStep {
                name: relations::FCT_DETECTIONS,
                inputs: &[relations::STG_DETECTIONS, relations::FCT_MESSAGES],
                build: |c, _| {
                    let rows = build_fct_detections(
                        c.staged_detections(relations::STG_DETECTIONS)?,
                        c.fct_messages(relations::FCT_MESSAGES)?,
                    );
                    Ok(Relation::FactDetections(rows).into())
                },
            },
            TransformStep {
                name: relations::FCT_MESSAGES,
                inputs: &[relations::STG_MESSAGES, relations::DIM_DATES],
                build: |c, _| {
                    let rows = build_fct_messages(
                        c.staged_messages(relations::STG_MESSAGES)?,
                        c.dim_dates(relations::DIM_DATES)?,
                    );
                    Ok(Relation::FactMessages(rows).into())
                },
            },
            TransformStep {
                name: relations::DIM_DATES,
                inputs: &[relations::STG_MESSAGES],
                build: |c, ctx| {
                    let rows = build_dim_dates(c.staged_messages(relations::STG_MESSAGES)?, ctx);
                    Ok(Relation::DimDates(rows).into())
                },
            },
            TransformStep {
                name: relations::DIM_CHANNELS,
                inputs: &[relations::STG_MESSAGES],
                build: |c, _| {
                    let rows = build_dim_channels(c.staged_messages(relations::STG_MESSAGES)?);
                    Ok(Relation::DimChannels(rows).into())
                },
            },
            TransformStep {
                name: relations::STG_DETECTIONS,
                inputs: &[relations::RAW_IMAGE_DETECTIONS],
                build: |c, _| {
                    let rows = stage_detections(c.raw_detections(relations::RAW_IMAGE_DETECTIONS)?);
                    Ok(Relation::StagedDetections(rows).into())
                },
            },
            TransformStep {
                name: relations::STG_MESSAGES,
                inputs: &[relations::RAW_MESSAGES],
                build: |c, _| {
                    let (rows, counts) = stage_messages(c.raw_messages(relations::RAW_MESSAGES)?);
                    Ok(StepOutput {
                        relation: Relation::StagedMessages(rows),
                        coercion_failures: counts,
                    })
                },
            },
        ])
    }

    /// Kahn ordering over step outputs. Inputs that no step produces must already
    /// be in `sources`. Ties break by step name so the order is stable.
    pub fn execution_order(&self, sources: &Catalog) -> Result<Vec<&TransformStep>> {
        let mut by_name: BTreeMap<&str, &TransformStep> = BTreeMap::new();
        for step in &self.steps {
            if by_name.insert(step.name, step).is_some() {
                bail!("transform step `{}` is declared twice", step.name);
            }
        }

        let mut pending: BTreeMap<&str, usize> = BTreeMap::new();
        let mut dependents: BTreeMap<&str, Vec<&str>> = BTreeMap::new();
        for step in &self.steps {
            let mut waiting = 0;
            for input in step.inputs {
                if by_name.contains_key(input) {
                    waiting += 1;
                    dependents.entry(*input).or_default().push(step.name);
                } else if !sources.contains(input) {
                    bail!("transform step `{}` reads unknown relation `{input}`", step.name);
                }
            }
            pending.insert(step.name, waiting);
        }

        let mut ready: BTreeSet<&str> = pending
            .iter()
            .filter(|(_, n)| **n == 0)
            .map(|(name, _)| *name)
            .collect();
        let mut order = Vec::with_capacity(self.steps.len());

        while let Some(name) = ready.pop_first() {
            order.push(by_name[name]);
            for dependent in dependents.get(name).into_iter().flatten() {
                if let Some(n) = pending.get_mut(dependent) {
                    *n -= 1;
                    if *n == 0 {
                        ready.insert(*dependent);
                    }
                }
            }
        }

        if order.len() != self.steps.len() {
            let stuck: Vec<_> = pending
                .iter()
                .filter(|(_, n)| **n > 0)
                .map(|(name, _)| *name)
                .collect();
            bail!("transform graph has a cycle through {}", stuck.join(", "));
        }
        Ok(order)
    }

    /// Execute every step. Outputs are added to `catalog` as they are built.
    pub fn run(&self, catalog: &mut Catalog, ctx: &TransformContext) -> Result<Vec<StepReport>> {
        let order: Vec<TransformStep> = self
            .execution_order(catalog)?
            .into_iter()
            .cloned()
            .collect();

        let mut reports = Vec::with_capacity(order.len());
        for step in order {
            let output = (step.build)(catalog, ctx)?;
            debug!(step = step.name, rows = output.relation.len(), "transform step built");
            reports.push(StepReport {
                relation: step.name.to_string(),
                rows: output.relation.len(),
                coercion_failures: output.coercion_failures,
            });
            catalog.insert(step.name, output.relation);
        }
        Ok(reports)
    }
}
