use std::fs;
use std::path::{Path, PathBuf};

use camino::{Utf8Path, Utf8PathBuf};
use indexmap::IndexMap;
use regex::Regex;
use tracing::{debug, info, warn};

use crate::accession::{Accession, AccessionType};
use crate::error::GeofetchError;
use crate::expand::expand_metadata_list;
use crate::ncbi::{fetch_metadata, parse_runinfo, split_metadata_lines, MetadataClient, RunInfoRow};
use crate::output::{
    print_json, render_config, write_annotation, write_processed_annotation, write_subannotation,
    ConfigValues, FetchSummary, DEFAULT_CONFIG_TEMPLATE,
};
use crate::processed::{collect_processed_files, convert_size, run_filter, run_size_filter};
use crate::sanitize::{sanitize_name, unique_name};
use crate::separate::{
    separate_common_meta, DEFAULT_ATTR_LIMIT_TRUNCATE, DEFAULT_DEL_LIMIT, DEFAULT_MAX_LEN,
};
use crate::soft::{parse_gsm_soft, FieldValue, Record, PROJECT_PATTERN};
use crate::sra::{download_run, existing_output, SraToolsClient, ToolStatus};
use crate::processed::FilelistSource;

/// Inclusion filter parsed from the input: GSE accession to a map of GSM
/// accessions and caller-chosen display names. An empty inner map keeps
/// every sample of that series.
pub type AccessionList = IndexMap<String, IndexMap<String, String>>;

/// Parse the `-i/--input` argument: either a single accession, or a path
/// to a tab-separated file with one `GSE[\tGSM[\tname]]` row per line.
pub fn parse_accessions(input: &str) -> Result<AccessionList, GeofetchError> {
    let path = Path::new(input);
    if !path.is_file() {
        let mut list = AccessionList::new();
        list.insert(input.to_string(), IndexMap::new());
        return Ok(list);
    }

    let content =
        fs::read_to_string(path).map_err(|_| GeofetchError::InputRead(path.to_path_buf()))?;
    let mut list = AccessionList::new();
    for line in content.lines() {
        let line = line.trim_end_matches('\r');
        if line.trim().is_empty() || line.starts_with('#') {
            continue;
        }
        let mut fields = line.split('\t');
        let Some(gse) = fields.next().map(str::trim).filter(|gse| !gse.is_empty()) else {
            continue;
        };
        let entry = list.entry(gse.to_string()).or_default();
        if let Some(gsm) = fields.next().map(str::trim).filter(|gsm| !gsm.is_empty()) {
            let name = fields.next().map(str::trim).unwrap_or("").to_string();
            entry.insert(gsm.to_string(), name);
        }
    }
    Ok(list)
}

#[derive(Debug, Clone)]
pub struct GeofetchOptions {
    pub name: Option<String>,
    pub metadata_root: Utf8PathBuf,
    pub metadata_folder: Option<Utf8PathBuf>,
    pub just_metadata: bool,
    pub refresh_metadata: bool,
    pub acc_anno: bool,
    pub use_key_subset: bool,
    pub split_experiments: bool,
    pub config_template: Option<PathBuf>,
    pub processed: bool,
    pub skip: usize,
    pub filter: Option<String>,
    pub filter_size: Option<String>,
    pub geo_folder: Option<Utf8PathBuf>,
    pub bam_folder: String,
    pub fq_folder: String,
    pub pipeline_interfaces: Option<String>,
    pub clean: bool,
    pub max_soft_size: Option<String>,
}

impl Default for GeofetchOptions {
    fn default() -> Self {
        Self {
            name: None,
            metadata_root: Utf8PathBuf::from("."),
            metadata_folder: None,
            just_metadata: false,
            refresh_metadata: false,
            acc_anno: false,
            use_key_subset: false,
            split_experiments: false,
            config_template: None,
            processed: false,
            skip: 0,
            filter: None,
            filter_size: None,
            geo_folder: None,
            bam_folder: String::new(),
            fq_folder: String::new(),
            pipeline_interfaces: None,
            clean: false,
            max_soft_size: None,
        }
    }
}

/// Sequential per-accession driver: fetch SOFT metadata, normalize it into
/// annotation tables, and (unless `--just-metadata`) pull raw or processed
/// data. Failures inside one accession are logged and recorded; the next
/// accession still runs.
pub struct Geofetcher<C, S> {
    client: C,
    tools: S,
    options: GeofetchOptions,
}

impl<C, S> Geofetcher<C, S>
where
    C: MetadataClient + FilelistSource,
    S: SraToolsClient,
{
    pub fn new(client: C, tools: S, options: GeofetchOptions) -> Self {
        Self {
            client,
            tools,
            options,
        }
    }

    pub fn run(&self, input: &str) -> Result<FetchSummary, GeofetchError> {
        // Startup validation is the one fatal class of error: without the
        // download tool there is no point touching any accession.
        if !self.options.just_metadata && !self.options.processed {
            if let ToolStatus::Missing { message } = self.tools.tool_status() {
                return Err(GeofetchError::MissingTool(message));
            }
        }

        let project_name = self.project_name(input);
        let metadata_folder = self.metadata_folder(&project_name);
        info!(folder = %metadata_folder, "metadata folder");
        fs::create_dir_all(metadata_folder.as_std_path())
            .map_err(|err| GeofetchError::Filesystem(err.to_string()))?;

        let accession_list = parse_accessions(input)?;
        let size_cap = self.soft_size_cap()?;

        let mut combined: IndexMap<String, Record> = IndexMap::new();
        let mut combined_sub: IndexMap<String, Vec<[String; 3]>> = IndexMap::new();
        let mut failed_runs: Vec<String> = Vec::new();
        let mut processed_sample_count = 0usize;

        let total = accession_list.len();
        for (index, (acc_gse, limit)) in accession_list.iter().enumerate() {
            if index < self.options.skip {
                continue;
            }
            if index == self.options.skip && self.options.skip > 0 {
                info!(skipped = self.options.skip, "skipped accessions, starting now");
            }
            info!(
                accession = acc_gse.as_str(),
                position = index + 1,
                total,
                "processing accession"
            );
            let accession: Accession = match acc_gse.parse() {
                Ok(accession) => accession,
                Err(err) => {
                    warn!(accession = acc_gse.as_str(), %err, "skipping malformed accession");
                    continue;
                }
            };
            if !limit.is_empty() {
                info!(samples = ?limit.keys().collect::<Vec<_>>(), "limiting to listed samples");
            }

            let result = self.process_accession(
                &accession,
                limit,
                &metadata_folder,
                size_cap,
                &mut combined,
                &mut combined_sub,
                &mut failed_runs,
            );
            match result {
                Ok(samples) => processed_sample_count += samples,
                Err(err) => {
                    warn!(accession = acc_gse.as_str(), %err, "accession failed; continuing");
                    failed_runs.push(acc_gse.clone());
                }
            }
        }

        info!(count = accession_list.len(), "finished processing accessions");
        if !failed_runs.is_empty() {
            warn!(failed = ?failed_runs, "some identifiers could not be processed");
        }

        let mut summary = FetchSummary {
            accessions_processed: accession_list.len(),
            samples: if self.options.processed {
                processed_sample_count
            } else {
                combined.len()
            },
            failed_runs,
            ..FetchSummary::default()
        };

        if !self.options.processed && !combined.is_empty() {
            self.write_project_outputs(
                &project_name,
                &metadata_folder,
                combined,
                combined_sub,
                &mut summary,
            )?;
        }

        if self.options.clean {
            clean_soft_files(&metadata_folder);
        }

        Ok(summary)
    }

    pub fn print_summary(&self, summary: &FetchSummary) -> Result<(), GeofetchError> {
        print_json(summary).map_err(|err| GeofetchError::Filesystem(err.to_string()))
    }

    #[allow(clippy::too_many_arguments)]
    fn process_accession(
        &self,
        accession: &Accession,
        limit: &IndexMap<String, String>,
        metadata_folder: &Utf8Path,
        size_cap: Option<u64>,
        combined: &mut IndexMap<String, Record>,
        combined_sub: &mut IndexMap<String, Vec<[String; 3]>>,
        failed_runs: &mut Vec<String>,
    ) -> Result<usize, GeofetchError> {
        let acc = accession.as_str();
        let file_gse = metadata_folder.join(format!("{acc}_GSE.soft"));
        let file_gsm = metadata_folder.join(format!("{acc}_GSM.soft"));
        let file_sra = metadata_folder.join(format!("{acc}_SRA.csv"));

        let gse_lines = self.soft_lines(accession, AccessionType::Gse, &file_gse, None)?;
        let gsm_lines = self.soft_lines(accession, AccessionType::Gsm, &file_gsm, size_cap)?;

        if self.options.processed {
            return self.process_processed(accession, &gse_lines, &gsm_lines, metadata_folder);
        }

        let table = parse_gsm_soft(&gsm_lines, limit);
        info!(samples = table.samples_processed, "processed samples");
        let mut records = table.records;

        let mut subannotation: IndexMap<String, Vec<[String; 3]>> = IndexMap::new();
        match self.find_sra_project(&gse_lines, &records) {
            Some(acc_srp) => {
                info!(srp = acc_srp.as_str(), "found SRA project accession");
                let runinfo = self.runinfo(&acc_srp, &file_sra)?;
                let filtered = self.merge_runinfo(
                    &runinfo,
                    limit,
                    &mut records,
                    &mut subannotation,
                    failed_runs,
                );
                self.write_filtered_runinfo(&runinfo, &filtered, metadata_folder, acc)?;
            }
            None => {
                warn!(
                    accession = acc,
                    "unable to get an SRA accession from the GSE SOFT file; no raw data?"
                );
            }
        }

        ensure_sample_names(&mut records);

        // Normalize repeated-key fields into columns before the records
        // join the combined project table.
        let keys: Vec<String> = records.keys().cloned().collect();
        let mut values: Vec<Record> = records.into_values().collect();
        expand_metadata_list(&mut values);
        let records: IndexMap<String, Record> = keys.into_iter().zip(values).collect();

        if self.options.acc_anno {
            let file_annotation = metadata_folder.join(format!("{acc}_annotation.csv"));
            write_annotation(
                &records,
                file_annotation.as_std_path(),
                self.options.use_key_subset,
            )?;
            if !subannotation.is_empty() {
                let file_sub = metadata_folder.join(format!("{acc}_subannotation.csv"));
                write_subannotation(&subannotation, file_sub.as_std_path())?;
            }
        }

        let count = records.len();
        combined.extend(records);
        combined_sub.extend(subannotation);
        Ok(count)
    }

    fn process_processed(
        &self,
        accession: &Accession,
        gse_lines: &[String],
        gsm_lines: &[String],
        metadata_folder: &Utf8Path,
    ) -> Result<usize, GeofetchError> {
        let acc = accession.as_str();
        let collected = collect_processed_files(gse_lines, gsm_lines, &self.client);
        let mut samples = collected.samples;
        let mut series = collected.series;

        if let Some(pattern) = &self.options.filter {
            samples = run_filter(&samples, pattern)?;
        }
        if let Some(size) = &self.options.filter_size {
            let cap = convert_size(size)?;
            samples = run_size_filter(&samples, cap);
        }

        if !self.options.just_metadata {
            let Some(geo_folder) = &self.options.geo_folder else {
                return Err(GeofetchError::Filesystem(
                    "a geo folder is required to download processed data".to_string(),
                ));
            };
            for record in samples.iter().chain(series.iter()) {
                let Some(url) = record.get("file_url").and_then(FieldValue::as_text) else {
                    continue;
                };
                let Some(file) = record.get("file").and_then(FieldValue::as_text) else {
                    continue;
                };
                let destination = geo_folder.join(acc).join(file);
                if destination.as_std_path().exists() {
                    info!(file, "file exists, skipping download");
                    continue;
                }
                self.client.download_file(url, destination.as_std_path())?;
            }
        }

        expand_metadata_list(&mut samples);
        expand_metadata_list(&mut series);

        let (sample_table, project_meta) = separate_common_meta(
            &samples,
            DEFAULT_MAX_LEN,
            DEFAULT_DEL_LIMIT,
            DEFAULT_ATTR_LIMIT_TRUNCATE,
        );

        let count = sample_table.len();
        let file_samples = metadata_folder.join(format!("{acc}_samples.csv"));
        if !sample_table.is_empty() {
            write_processed_annotation(&sample_table, file_samples.as_std_path())?;
            let template = self.config_template()?;
            let rendered = render_config(
                &template,
                &ConfigValues {
                    project_name: acc,
                    annotation: file_samples
                        .file_name()
                        .unwrap_or_default(),
                    subannotation: "null",
                    pipeline_interfaces: self
                        .options
                        .pipeline_interfaces
                        .as_deref()
                        .unwrap_or("null"),
                    project_metadata: &project_meta,
                },
            );
            let file_config = metadata_folder.join(format!("{acc}_samples.yaml"));
            fs::write(file_config.as_std_path(), rendered)
                .map_err(|err| GeofetchError::Filesystem(err.to_string()))?;
            info!(path = %file_config, "wrote processed project config");
        }
        if !series.is_empty() {
            let file_series = metadata_folder.join(format!("{acc}_series.csv"));
            write_processed_annotation(&series, file_series.as_std_path())?;
        }
        Ok(count)
    }

    /// Merge SRA run-info rows into the GSM record table, tracking
    /// multi-run experiments. Returns the indices of rows that matched a
    /// known experiment, for the filtered run-info sheet.
    fn merge_runinfo(
        &self,
        runinfo: &[RunInfoRow],
        limit: &IndexMap<String, String>,
        records: &mut IndexMap<String, Record>,
        subannotation: &mut IndexMap<String, Vec<[String; 3]>>,
        failed_runs: &mut Vec<String>,
    ) -> Vec<usize> {
        let mut kept = Vec::new();
        let mut split_counts: IndexMap<String, u32> = IndexMap::new();

        for (row_index, row) in runinfo.iter().enumerate() {
            let Some(experiment) = row.get("Experiment").filter(|exp| !exp.is_empty()) else {
                continue;
            };
            let Some(run_name) = row.get("Run").filter(|run| !run.is_empty()) else {
                continue;
            };
            if !records.contains_key(experiment) {
                debug!(
                    experiment = experiment.as_str(),
                    "run-info row for unknown experiment; skipping"
                );
                continue;
            }
            kept.push(row_index);

            let sample_name = resolve_sample_name(records, experiment, limit);
            let read_type = row.get("LibraryLayout").cloned().unwrap_or_default();
            let Some(record) = records.get_mut(experiment) else {
                continue;
            };
            update_columns(record, experiment, &sample_name, &read_type);

            let previous = record
                .get("SRR")
                .and_then(FieldValue::as_text)
                .map(str::to_string);
            match previous {
                None => {
                    // First run for this experiment.
                    record.insert("SRR".to_string(), FieldValue::Text(run_name.clone()));
                }
                Some(previous) => {
                    info!(
                        run = run_name.as_str(),
                        experiment = experiment.as_str(),
                        "found additional run"
                    );
                    if self.options.split_experiments {
                        self.split_additional_run(
                            records,
                            subannotation,
                            &mut split_counts,
                            experiment,
                            &sample_name,
                            run_name,
                        );
                    } else {
                        if previous != "multi" && !subannotation.contains_key(experiment) {
                            // Second run: create the list and retroactively
                            // append the first run, stored as a scalar so far.
                            subannotation.entry(experiment.to_string()).or_default().push([
                                sample_name.clone(),
                                experiment.clone(),
                                previous,
                            ]);
                        }
                        subannotation.entry(experiment.to_string()).or_default().push([
                            sample_name.clone(),
                            experiment.clone(),
                            run_name.clone(),
                        ]);
                        record.insert("SRR".to_string(), FieldValue::Text("multi".to_string()));
                    }
                }
            }

            info!(
                run = run_name.as_str(),
                experiment = experiment.as_str(),
                "get SRR"
            );
            self.maybe_download_run(run_name, failed_runs);
        }

        // Split mode leaves the original experiment entry behind as a
        // template; the per-run clones replace it.
        if self.options.split_experiments {
            for (experiment, count) in &split_counts {
                if *count >= 2 {
                    records.shift_remove(experiment);
                }
            }
        }
        kept
    }

    /// Split-experiment branch: every run becomes its own sample entry
    /// (`SRX_1`, `SRX_2`, ...). The subsample table only records the
    /// additional runs; the retroactive first-run entry of the default
    /// branch is not emitted here.
    fn split_additional_run(
        &self,
        records: &mut IndexMap<String, Record>,
        subannotation: &mut IndexMap<String, Vec<[String; 3]>>,
        split_counts: &mut IndexMap<String, u32>,
        experiment: &str,
        sample_name: &str,
        run_name: &str,
    ) {
        let count = split_counts.entry(experiment.to_string()).or_insert(1);
        *count += 1;
        let rep_number = *count;

        if rep_number == 2 {
            // First additional run: give the original run its own entry too.
            let template = records.get(experiment).cloned().unwrap_or_default();
            let mut first = template;
            let first_name = format!("{sample_name}_1");
            first.insert("sample_name".to_string(), FieldValue::Text(first_name));
            records.insert(format!("{experiment}_1"), first);
        }

        let mut clone = records.get(experiment).cloned().unwrap_or_default();
        clone.insert(
            "sample_name".to_string(),
            FieldValue::Text(format!("{sample_name}_{rep_number}")),
        );
        clone.insert("SRR".to_string(), FieldValue::Text(run_name.to_string()));
        records.insert(format!("{experiment}_{rep_number}"), clone);

        subannotation
            .entry(experiment.to_string())
            .or_default()
            .push([
                sample_name.to_string(),
                experiment.to_string(),
                run_name.to_string(),
            ]);
    }

    fn maybe_download_run(&self, run_name: &str, failed_runs: &mut Vec<String>) {
        if let Some(existing) = existing_output(run_name, &self.options.bam_folder, &self.options.fq_folder)
        {
            info!(path = %existing.display(), "output found, skipping run download");
            return;
        }
        if self.options.just_metadata {
            debug!(run = run_name, "dry run, no data download");
            return;
        }
        if let Err(err) = download_run(&self.tools, run_name) {
            warn!(run = run_name, %err, "error occurred while downloading SRA file");
            failed_runs.push(run_name.to_string());
        }
    }

    fn write_filtered_runinfo(
        &self,
        runinfo: &[RunInfoRow],
        kept: &[usize],
        metadata_folder: &Utf8Path,
        acc: &str,
    ) -> Result<(), GeofetchError> {
        if runinfo.is_empty() {
            return Ok(());
        }
        let path = metadata_folder.join(format!("{acc}_SRA_filt.csv"));
        let mut writer = csv::Writer::from_path(path.as_std_path())
            .map_err(|err| GeofetchError::Filesystem(err.to_string()))?;
        let headers: Vec<&String> = runinfo[0].keys().collect();
        writer
            .write_record(&headers)
            .map_err(|err| GeofetchError::Filesystem(err.to_string()))?;
        for index in kept {
            let row: Vec<String> = headers
                .iter()
                .map(|header| runinfo[*index].get(*header).cloned().unwrap_or_default())
                .collect();
            writer
                .write_record(&row)
                .map_err(|err| GeofetchError::Filesystem(err.to_string()))?;
        }
        writer
            .flush()
            .map_err(|err| GeofetchError::Filesystem(err.to_string()))?;
        Ok(())
    }

    /// Locate the SRA project for a series. Falls back to a lone SRX table
    /// key when the GSE SOFT file never mentions an SRP (no raw data was
    /// deposited at the series level, but a sample may still link an
    /// experiment).
    fn find_sra_project(
        &self,
        gse_lines: &[String],
        records: &IndexMap<String, Record>,
    ) -> Option<Accession> {
        let project_re = Regex::new(PROJECT_PATTERN).unwrap();
        for line in gse_lines {
            if let Some(found) = project_re.find(line) {
                return found.as_str().parse().ok();
            }
        }
        if records.len() == 1 {
            let key = records.keys().next()?;
            if key.starts_with("SRX") {
                warn!(
                    srx = key.as_str(),
                    "no SRP for this series; using the sample's SRX identifier instead"
                );
                return key.parse().ok();
            }
        }
        None
    }

    fn runinfo(
        &self,
        acc_srp: &Accession,
        file_sra: &Utf8Path,
    ) -> Result<Vec<RunInfoRow>, GeofetchError> {
        let text = if file_sra.as_std_path().is_file() && !self.options.refresh_metadata {
            info!(path = %file_sra, "found previous SRA file");
            fs::read_to_string(file_sra.as_std_path())
                .map_err(|err| GeofetchError::Filesystem(err.to_string()))?
        } else {
            let destination = (!self.options.clean).then(|| file_sra.as_std_path());
            fetch_metadata(&self.client, acc_srp, acc_srp.kind(), destination, None)?.join("\n")
        };
        parse_runinfo(&text)
    }

    fn soft_lines(
        &self,
        accession: &Accession,
        kind: AccessionType,
        path: &Utf8Path,
        size_cap: Option<u64>,
    ) -> Result<Vec<String>, GeofetchError> {
        if path.as_std_path().is_file() && !self.options.refresh_metadata {
            info!(path = %path, "found previous SOFT file");
            let text = fs::read_to_string(path.as_std_path())
                .map_err(|err| GeofetchError::Filesystem(err.to_string()))?;
            return Ok(split_metadata_lines(&text));
        }
        if self.options.refresh_metadata {
            info!("refreshing metadata");
        }
        let destination = (!self.options.clean).then(|| path.as_std_path());
        fetch_metadata(&self.client, accession, kind, destination, size_cap)
    }

    fn write_project_outputs(
        &self,
        project_name: &str,
        metadata_folder: &Utf8Path,
        combined: IndexMap<String, Record>,
        combined_sub: IndexMap<String, Vec<[String; 3]>>,
        summary: &mut FetchSummary,
    ) -> Result<(), GeofetchError> {
        info!("creating complete project annotation sheets and config file");

        let keys: Vec<String> = combined.keys().cloned().collect();
        let values: Vec<Record> = combined.into_values().collect();
        let (sample_table, project_meta) = separate_common_meta(
            &values,
            DEFAULT_MAX_LEN,
            DEFAULT_DEL_LIMIT,
            DEFAULT_ATTR_LIMIT_TRUNCATE,
        );
        let table: IndexMap<String, Record> = keys.into_iter().zip(sample_table).collect();

        let file_annotation = metadata_folder.join(format!("{project_name}_annotation.csv"));
        write_annotation(
            &table,
            file_annotation.as_std_path(),
            self.options.use_key_subset,
        )?;
        summary.annotation = Some(file_annotation.to_string());

        let file_subannotation = if combined_sub.is_empty() {
            "null".to_string()
        } else {
            let path = metadata_folder.join(format!("{project_name}_subannotation.csv"));
            write_subannotation(&combined_sub, path.as_std_path())?;
            summary.subannotation = Some(path.to_string());
            path.file_name().unwrap_or("null").to_string()
        };

        let template = self.config_template()?;
        let rendered = render_config(
            &template,
            &ConfigValues {
                project_name,
                annotation: file_annotation.file_name().unwrap_or_default(),
                subannotation: &file_subannotation,
                pipeline_interfaces: self
                    .options
                    .pipeline_interfaces
                    .as_deref()
                    .unwrap_or("null"),
                project_metadata: &project_meta,
            },
        );
        let file_config = metadata_folder.join(format!("{project_name}_config.yaml"));
        fs::write(file_config.as_std_path(), rendered)
            .map_err(|err| GeofetchError::Filesystem(err.to_string()))?;
        info!(path = %file_config, "wrote project config file");
        summary.config = Some(file_config.to_string());
        summary.samples = table.len();
        Ok(())
    }

    fn config_template(&self) -> Result<String, GeofetchError> {
        match &self.options.config_template {
            Some(path) => {
                fs::read_to_string(path).map_err(|_| GeofetchError::TemplateRead(path.clone()))
            }
            None => Ok(DEFAULT_CONFIG_TEMPLATE.to_string()),
        }
    }

    fn project_name(&self, input: &str) -> String {
        if let Some(name) = &self.options.name {
            return name.clone();
        }
        Path::new(input)
            .file_stem()
            .and_then(|stem| stem.to_str())
            .unwrap_or(input)
            .to_string()
    }

    fn metadata_folder(&self, project_name: &str) -> Utf8PathBuf {
        match &self.options.metadata_folder {
            Some(folder) => folder.clone(),
            None => self.options.metadata_root.join(project_name),
        }
    }

    fn soft_size_cap(&self) -> Result<Option<u64>, GeofetchError> {
        self.options
            .max_soft_size
            .as_deref()
            .map(convert_size)
            .transpose()
    }
}

/// Populate the standard annotation columns for an experiment, from the
/// fields already on the record plus the run-info row.
pub fn update_columns(record: &mut Record, experiment: &str, sample_name: &str, read_type: &str) {
    record.insert(
        "sample_name".to_string(),
        FieldValue::Text(sample_name.to_string()),
    );
    let selection = record
        .get("Sample_library_selection")
        .map(|value| value.to_string())
        .unwrap_or_default();
    record.insert("protocol".to_string(), FieldValue::Text(selection.clone()));
    record.insert(
        "read_type".to_string(),
        FieldValue::Text(read_type.to_string()),
    );
    let organism = record
        .get("Sample_organism_ch1")
        .map(|value| value.to_string())
        .unwrap_or_default();
    record.insert("organism".to_string(), FieldValue::Text(organism));
    record.insert(
        "data_source".to_string(),
        FieldValue::Text("SRA".to_string()),
    );
    record.insert(
        "SRX".to_string(),
        FieldValue::Text(experiment.to_string()),
    );

    // Refine the protocol for bisulfite libraries, where the selection
    // field encodes the assay.
    let strategy = record
        .get("Sample_library_strategy")
        .map(|value| value.to_string())
        .unwrap_or_default();
    if strategy == "Bisulfite-Seq" {
        let refined = match selection.to_lowercase().as_str() {
            "reduced representation" => Some("RRBS"),
            "random" => Some("WGBS"),
            _ => None,
        };
        if let Some(refined) = refined {
            record.insert(
                "protocol".to_string(),
                FieldValue::Text(refined.to_string()),
            );
        }
    }
}

fn resolve_sample_name(
    records: &IndexMap<String, Record>,
    experiment: &str,
    limit: &IndexMap<String, String>,
) -> String {
    let record = &records[experiment];
    let from_limit = record
        .get("gsm_id")
        .and_then(FieldValue::as_text)
        .and_then(|gsm_id| limit.get(gsm_id))
        .filter(|name| !name.is_empty())
        .cloned();
    if let Some(name) = from_limit {
        return name;
    }
    let title = record
        .get("Sample_title")
        .map(|value| value.to_string())
        .unwrap_or_default();
    if title.is_empty() {
        experiment.to_lowercase()
    } else {
        sanitize_name(&title)
    }
}

/// Every record leaves the engine with a usable `sample_name`, even when
/// no SRA data was ever linked: fall back to the sanitized sample title,
/// deduplicated within the table.
fn ensure_sample_names(records: &mut IndexMap<String, Record>) {
    let mut used: Vec<String> = records
        .values()
        .filter_map(|record| record.get("sample_name").and_then(FieldValue::as_text))
        .filter(|name| !name.is_empty())
        .map(str::to_string)
        .collect();
    for (key, record) in records.iter_mut() {
        let current = record
            .get("sample_name")
            .and_then(FieldValue::as_text)
            .unwrap_or("");
        if !current.is_empty() {
            continue;
        }
        let title = record
            .get("Sample_title")
            .map(|value| value.to_string())
            .unwrap_or_default();
        let base = if title.is_empty() {
            key.to_lowercase()
        } else {
            sanitize_name(&title)
        };
        let name = unique_name(&base, &used);
        used.push(name.clone());
        record.insert("sample_name".to_string(), FieldValue::Text(name));
    }
}

/// Drop the cached SOFT and run-info files from a metadata folder.
pub fn clean_soft_files(folder: &Utf8Path) {
    let Ok(entries) = fs::read_dir(folder.as_std_path()) else {
        return;
    };
    for entry in entries.flatten() {
        let name = entry.file_name();
        let Some(name) = name.to_str() else { continue };
        if name.ends_with(".soft") || name.ends_with("_SRA.csv") || name.ends_with("_SRA_filt.csv")
        {
            debug!(file = name, "removing cached metadata file");
            let _ = fs::remove_file(entry.path());
        }
    }
}
