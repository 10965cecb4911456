use log::info;
use mysql::prelude::Queryable;
use mysql::{params, Conn, OptsBuilder, Params, TxOpts};
use std::error::Error;

use crate::batch::RowBatch;
use crate::config::MysqlConfig;
use crate::transform::parse_case_month;

const CREATE_TABLE_SQL: &str = r"
CREATE TABLE IF NOT EXISTS cdc_covid_cases (
    id INT AUTO_INCREMENT PRIMARY KEY,
    case_month DATE,
    res_state VARCHAR(50),
    state_fips_code INT,
    age_group VARCHAR(50),
    sex VARCHAR(20),
    race VARCHAR(100),
    ethnicity VARCHAR(100),
    case_positive_specimen_interval INT,
    case_onset_interval INT,
    process VARCHAR(50),
    exposure_yn VARCHAR(20),
    current_status VARCHAR(50),
    symptom_status VARCHAR(50),
    hosp_yn VARCHAR(20),
    icu_yn VARCHAR(20),
    death_yn VARCHAR(20),
    underlying_conditions_yn VARCHAR(20),
    UNIQUE KEY unique_case (case_month, res_state, age_group, sex, race, ethnicity)
);";

// On a unique-key conflict only the volatile observation fields are updated,
// everything else keeps its originally inserted value.
const UPSERT_SQL: &str = r"
INSERT INTO cdc_covid_cases
    (case_month, res_state, state_fips_code, age_group,
    sex, race, ethnicity, case_positive_specimen_interval, case_onset_interval,
    process, exposure_yn, current_status, symptom_status,
    hosp_yn, icu_yn, death_yn, underlying_conditions_yn)
VALUES
    (:case_month, :res_state, :state_fips_code, :age_group,
    :sex, :race, :ethnicity, :case_positive_specimen_interval, :case_onset_interval,
    :process, :exposure_yn, :current_status, :symptom_status,
    :hosp_yn, :icu_yn, :death_yn, :underlying_conditions_yn)
ON DUPLICATE KEY UPDATE
    death_yn = VALUES(death_yn),
    hosp_yn = VALUES(hosp_yn),
    icu_yn = VALUES(icu_yn),
    underlying_conditions_yn = VALUES(underlying_conditions_yn)";

/// One fully-filled record ready for the insert statement.  Columns the
/// source batch does not carry get their documented defaults.
#[derive(Debug, Clone, PartialEq)]
pub struct CaseRecord {
    pub case_month: Option<String>,
    pub res_state: String,
    pub state_fips_code: i64,
    pub age_group: String,
    pub sex: String,
    pub race: String,
    pub ethnicity: String,
    pub case_positive_specimen_interval: i64,
    pub case_onset_interval: i64,
    pub process: String,
    pub exposure_yn: String,
    pub current_status: String,
    pub symptom_status: String,
    pub hosp_yn: String,
    pub icu_yn: String,
    pub death_yn: String,
    pub underlying_conditions_yn: String,
}

impl CaseRecord {
    pub fn from_batch_row(batch: &RowBatch, row: usize) -> CaseRecord {
        let text = |column: &str| -> String {
            batch
                .get(row, column)
                .map(|s| s.to_string())
                .unwrap_or_else(|| "Unknown".to_string())
        };
        let integer = |column: &str| -> i64 {
            batch
                .get(row, column)
                .and_then(|s| s.trim().parse::<i64>().ok())
                .unwrap_or(0)
        };
        CaseRecord {
            // serialized as an ISO date string, NULL when it does not parse
            case_month: batch
                .get(row, "case_month")
                .and_then(parse_case_month)
                .map(|d| d.to_string()),
            res_state: text("res_state"),
            state_fips_code: integer("state_fips_code"),
            age_group: text("age_group"),
            sex: text("sex"),
            race: text("race"),
            ethnicity: text("ethnicity"),
            case_positive_specimen_interval: integer("case_positive_specimen_interval"),
            case_onset_interval: integer("case_onset_interval"),
            process: text("process"),
            exposure_yn: text("exposure_yn"),
            current_status: text("current_status"),
            symptom_status: text("symptom_status"),
            hosp_yn: text("hosp_yn"),
            icu_yn: text("icu_yn"),
            death_yn: text("death_yn"),
            underlying_conditions_yn: text("underlying_conditions_yn"),
        }
    }

    fn to_params(&self) -> Params {
        params! {
            "case_month" => self.case_month.clone(),
            "res_state" => self.res_state.clone(),
            "state_fips_code" => self.state_fips_code,
            "age_group" => self.age_group.clone(),
            "sex" => self.sex.clone(),
            "race" => self.race.clone(),
            "ethnicity" => self.ethnicity.clone(),
            "case_positive_specimen_interval" => self.case_positive_specimen_interval,
            "case_onset_interval" => self.case_onset_interval,
            "process" => self.process.clone(),
            "exposure_yn" => self.exposure_yn.clone(),
            "current_status" => self.current_status.clone(),
            "symptom_status" => self.symptom_status.clone(),
            "hosp_yn" => self.hosp_yn.clone(),
            "icu_yn" => self.icu_yn.clone(),
            "death_yn" => self.death_yn.clone(),
            "underlying_conditions_yn" => self.underlying_conditions_yn.clone(),
        }
    }
}

/// One line of an aggregate count, keyed by the grouping value.
#[derive(Debug, Clone, PartialEq)]
pub struct GroupCount {
    pub group: String,
    pub total_cases: i64,
}

/// Owns the single long-lived MySQL connection for the process lifetime.
pub struct CdcCasesArchive {
    conn: Option<Conn>,
}

impl CdcCasesArchive {
    pub fn connect(config: &MysqlConfig) -> Result<CdcCasesArchive, Box<dyn Error>> {
        let opts = OptsBuilder::new()
            .ip_or_hostname(Some(config.host.clone()))
            .tcp_port(config.port)
            .user(Some(config.user.clone()))
            .pass(Some(config.password.clone()))
            .db_name(Some(config.database.clone()));
        let conn = Conn::new(opts)?;
        info!(
            "connected to mysql database '{}' on {}:{}",
            config.database, config.host, config.port
        );
        Ok(CdcCasesArchive { conn: Some(conn) })
    }

    fn conn(&mut self) -> Result<&mut Conn, Box<dyn Error>> {
        self.conn
            .as_mut()
            .ok_or_else(|| "database connection is closed".into())
    }

    /// Create the cdc_covid_cases table if it does not exist.  Safe to call
    /// on every startup.
    pub fn create_tables(&mut self) -> Result<(), Box<dyn Error>> {
        self.conn()?.query_drop(CREATE_TABLE_SQL)?;
        info!("table 'cdc_covid_cases' checked/created");
        Ok(())
    }

    /// Insert a cleaned batch, updating the volatile fields of rows that
    /// collide on the unique case key.  The whole batch commits or rolls
    /// back together.
    pub fn upsert(&mut self, batch: &RowBatch) -> Result<usize, Box<dyn Error>> {
        if batch.is_empty() {
            return Ok(0);
        }
        let records: Vec<CaseRecord> = (0..batch.len())
            .map(|row| CaseRecord::from_batch_row(batch, row))
            .collect();
        let conn = self.conn()?;
        let mut tx = conn.start_transaction(TxOpts::default())?;
        tx.exec_batch(UPSERT_SQL, records.iter().map(CaseRecord::to_params))?;
        tx.commit()?;
        info!("inserted/updated {} rows in cdc_covid_cases", records.len());
        Ok(records.len())
    }

    /// Total cases grouped by state, optionally filtered to one state code,
    /// largest first.
    pub fn total_cases_by_state(
        &mut self,
        state_code: Option<&str>,
    ) -> Result<Vec<GroupCount>, Box<dyn Error>> {
        let conn = self.conn()?;
        let rows = match state_code {
            Some(code) => conn.exec_map(
                "SELECT res_state, COUNT(*) AS total_cases
                 FROM cdc_covid_cases
                 WHERE res_state = :state
                 GROUP BY res_state
                 ORDER BY total_cases DESC",
                params! { "state" => code },
                |(group, total_cases)| GroupCount { group, total_cases },
            )?,
            None => conn.query_map(
                "SELECT res_state, COUNT(*) AS total_cases
                 FROM cdc_covid_cases
                 GROUP BY res_state
                 ORDER BY total_cases DESC",
                |(group, total_cases)| GroupCount { group, total_cases },
            )?,
        };
        info!("query 'total_cases_by_state' returned {} rows", rows.len());
        Ok(rows)
    }

    /// Total cases grouped by age group, largest first.
    pub fn cases_by_age_group(&mut self) -> Result<Vec<GroupCount>, Box<dyn Error>> {
        let rows = self.conn()?.query_map(
            "SELECT age_group, COUNT(*) AS total_cases
             FROM cdc_covid_cases
             GROUP BY age_group
             ORDER BY total_cases DESC",
            |(group, total_cases)| GroupCount { group, total_cases },
        )?;
        info!("query 'cases_by_age_group' returned {} rows", rows.len());
        Ok(rows)
    }

    /// Total cases grouped by sex, largest first.
    pub fn cases_by_sex(&mut self) -> Result<Vec<GroupCount>, Box<dyn Error>> {
        let rows = self.conn()?.query_map(
            "SELECT sex, COUNT(*) AS total_cases
             FROM cdc_covid_cases
             GROUP BY sex
             ORDER BY total_cases DESC",
            |(group, total_cases)| GroupCount { group, total_cases },
        )?;
        info!("query 'cases_by_sex' returned {} rows", rows.len());
        Ok(rows)
    }

    /// Drop the connection.  Safe to call more than once.
    pub fn close(&mut self) {
        if self.conn.take().is_some() {
            info!("mysql connection closed");
        }
    }
}
