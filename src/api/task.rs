use actix_web::{get, post, web, Scope};
use chrono::{DateTime, Utc};
use serde::Deserialize;

use crate::{
    error::Error,
    service::{CreateTask, Service},
    task::TaskView,
};

use super::{Created, Envelope, IdQuery, WirePayload};

#[derive(Debug, Deserialize)]
pub struct CreateTaskRequest {
    kind: String,
    payload: WirePayload,
    priority: Option<u8>,
    #[serde(default)]
    auto_confirm: bool,
    start_at: Option<DateTime<Utc>>,
}

#[post("/create")]
async fn create_task(
    service: web::Data<Service>,
    data: web::Json<CreateTaskRequest>,
) -> Result<web::Json<Envelope<Created>>, Error> {
    let data = data.into_inner();

    let id = service
        .create_task(CreateTask {
            kind: data.kind,
            payload: data.payload.into(),
            priority: data.priority,
            auto_confirm: data.auto_confirm,
            start_at: data.start_at,
        })
        .await?;

    Ok(web::Json(Envelope::success(Created { id })))
}

#[post("/confirm")]
async fn confirm_task(
    service: web::Data<Service>,
    query: web::Query<IdQuery>,
) -> Result<web::Json<Envelope<()>>, Error> {
    service.confirm_task(query.id).await?;

    Ok(web::Json(Envelope::success(())))
}

#[get("/check")]
async fn check_task(
    service: web::Data<Service>,
    query: web::Query<IdQuery>,
) -> Result<web::Json<Envelope<TaskView>>, Error> {
    let view = service.check_task(query.id).await?;

    Ok(web::Json(Envelope::success(view)))
}

pub fn service() -> Scope {
    web::scope("/task")
        .service(create_task)
        .service(confirm_task)
        .service(check_task)
}
