use std::collections::BTreeMap;
use std::sync::Arc;

use medsum_contracts::{
    AuthorizationContext, LabObservation, MedicationRecord, ProblemRecord, VitalObservation,
};
use serde_json::{Map, Value};

use crate::normalize;
use crate::pagination::{PageRequest, collect_paginated};
use crate::rate_limit::RateLimitedExecutor;
use crate::transport::{ToolError, ToolTransport};

#[derive(Debug, Clone, Copy)]
pub struct Paging {
    pub page_size: usize,
    pub max_pages: usize,
}

/// Typed clinical reads for one patient at one station.
#[derive(Clone)]
pub struct ClinicalTools {
    transport: Arc<dyn ToolTransport>,
    executor: RateLimitedExecutor,
    patient_icn: String,
    station: String,
    paging: Paging,
}

impl ClinicalTools {
    pub fn new(
        transport: Arc<dyn ToolTransport>,
        executor: RateLimitedExecutor,
        context: &AuthorizationContext,
        paging: Paging,
    ) -> Self {
        Self {
            transport,
            executor,
            patient_icn: context.patient_identifier().to_string(),
            station: context.site_id().to_string(),
            paging,
        }
    }

    pub async fn fetch_medications(
        &self,
        include_pending: bool,
        days_back: u32,
    ) -> Result<Vec<MedicationRecord>, ToolError> {
        let mut args = self.base_args();
        args.insert(
            "return_all_active_and_pending".to_string(),
            include_pending.into(),
        );
        args.insert("active_only".to_string(), false.into());
        args.insert("days_back".to_string(), days_back.into());

        let raw = self
            .collect("get_patient_medications", args, "medications")
            .await?;
        Ok(normalize::normalize_medications(&raw))
    }

    pub async fn fetch_problems(
        &self,
        active_only: bool,
        days_back: u32,
    ) -> Result<Vec<ProblemRecord>, ToolError> {
        let mut args = self.base_args();
        args.insert("days_back".to_string(), days_back.into());
        args.insert("active_only".to_string(), active_only.into());

        let raw = self.collect("get_patient_problems", args, "problems").await?;
        Ok(raw.iter().map(normalize::convert_problem).collect())
    }

    pub async fn fetch_labs(
        &self,
        days_back: u32,
        n_most_recent: u32,
    ) -> Result<BTreeMap<String, Vec<LabObservation>>, ToolError> {
        let mut args = self.base_args();
        args.insert("days_back".to_string(), days_back.into());
        args.insert("n_most_recent".to_string(), n_most_recent.into());

        let raw = self.collect("get_patient_labs", args, "labs").await?;
        Ok(normalize::group_labs(&raw, n_most_recent as usize))
    }

    pub async fn fetch_vitals(
        &self,
        days_back: u32,
        n_most_recent: u32,
    ) -> Result<BTreeMap<String, Vec<VitalObservation>>, ToolError> {
        let mut args = self.base_args();
        args.insert("days_back".to_string(), days_back.into());
        args.insert("n_most_recent".to_string(), n_most_recent.into());

        let raw = self
            .collect("get_patient_vitals", args, "vital_signs")
            .await?;
        Ok(normalize::group_vitals(&raw, n_most_recent as usize))
    }

    fn base_args(&self) -> Map<String, Value> {
        let mut args = Map::new();
        args.insert("patient_icn".to_string(), self.patient_icn.clone().into());
        args.insert("station".to_string(), self.station.clone().into());
        args
    }

    async fn collect(
        &self,
        tool_name: &str,
        base_args: Map<String, Value>,
        item_key: &str,
    ) -> Result<Vec<Value>, ToolError> {
        collect_paginated(
            self.transport.as_ref(),
            &self.executor,
            PageRequest {
                tool_name,
                base_args,
                item_key,
                page_size: self.paging.page_size,
                max_pages: self.paging.max_pages,
            },
        )
        .await
    }
}
