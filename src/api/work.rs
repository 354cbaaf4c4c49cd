use actix_web::{post, web, Scope};
use serde::Deserialize;
use uuid::Uuid;

use crate::{
    error::Error,
    service::{Service, WorkError},
    task::TaskView,
};

use super::{poll_duration, split_list, Envelope, WirePayload};

#[derive(Debug, Deserialize)]
pub struct TakeQuery {
    /// Comma separated task kinds.
    kind: String,
    limit: Option<usize>,
    /// Seconds to wait for work when none is ready.
    poll: Option<f64>,
}

#[post("/take")]
async fn take_work(
    service: web::Data<Service>,
    query: web::Query<TakeQuery>,
) -> Result<web::Json<Envelope<Vec<TaskView>>>, Error> {
    let kinds = split_list(&query.kind).map(String::from).collect::<Vec<_>>();
    let poll = poll_duration(query.poll, service.max_poll())?;

    let tasks = service
        .take_work(&kinds, query.limit.unwrap_or(1), poll)
        .await?;

    Ok(web::Json(Envelope::success(
        tasks.iter().map(TaskView::from).collect(),
    )))
}

#[derive(Debug, Deserialize)]
pub struct FinishRequest {
    id: Uuid,
    report: Option<WirePayload>,
    error: Option<WorkError>,
}

#[post("/finish")]
async fn finish_work(
    service: web::Data<Service>,
    data: web::Json<FinishRequest>,
) -> Result<web::Json<Envelope<()>>, Error> {
    let data = data.into_inner();

    service
        .finish_work(data.id, data.report.map(Into::into), data.error)
        .await?;

    Ok(web::Json(Envelope::success(())))
}

pub fn service() -> Scope {
    web::scope("/work").service(take_work).service(finish_work)
}
