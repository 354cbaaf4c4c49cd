use actix_web::{get, post, web, Scope};
use chrono::{DateTime, Utc};
use serde::Deserialize;
use uuid::Uuid;

use crate::{
    error::Error,
    message::{Delivery, MessageView},
    service::{AckItem, CreateMessage, NackItem, RedirectItem, Service},
};

use super::{poll_duration, split_list, Acknowledged, Created, Envelope, IdQuery, WirePayload};

#[derive(Debug, Deserialize)]
pub struct CreateMessageRequest {
    queue: String,
    payload: WirePayload,
    priority: Option<u8>,
    #[serde(default)]
    auto_confirm: bool,
    start_at: Option<DateTime<Utc>>,
    #[serde(default)]
    hold: bool,
}

#[post("/create")]
async fn create_message(
    service: web::Data<Service>,
    data: web::Json<CreateMessageRequest>,
) -> Result<web::Json<Envelope<Created>>, Error> {
    let data = data.into_inner();

    let id = service
        .create_message(CreateMessage {
            queue: data.queue,
            payload: data.payload.into(),
            priority: data.priority,
            auto_confirm: data.auto_confirm,
            start_at: data.start_at,
            hold: data.hold,
        })
        .await?;

    Ok(web::Json(Envelope::success(Created { id })))
}

#[post("/confirm")]
async fn confirm_message(
    service: web::Data<Service>,
    query: web::Query<IdQuery>,
) -> Result<web::Json<Envelope<()>>, Error> {
    service.confirm_message(query.id).await?;

    Ok(web::Json(Envelope::success(())))
}

pub fn service() -> Scope {
    web::scope("/message")
        .service(create_message)
        .service(confirm_message)
}

#[derive(Debug, Deserialize)]
pub struct ConsumeRequest {
    queue: String,
    limit: Option<usize>,
    /// Seconds to wait when the queue is empty.
    poll: Option<f64>,
}

#[post("/consume")]
async fn consume(
    service: web::Data<Service>,
    data: web::Json<ConsumeRequest>,
) -> Result<web::Json<Vec<Delivery>>, Error> {
    let poll = poll_duration(data.poll, service.max_poll())?;

    let messages = service
        .consume(&data.queue, data.limit.unwrap_or(1), poll)
        .await?;

    Ok(web::Json(messages.iter().map(Delivery::from).collect()))
}

#[post("/ack")]
async fn ack(
    service: web::Data<Service>,
    data: web::Json<Vec<AckItem>>,
) -> Result<web::Json<Acknowledged>, Error> {
    service.ack(data.into_inner()).await?;

    Ok(web::Json(Acknowledged::new()))
}

#[post("/nack")]
async fn nack(
    service: web::Data<Service>,
    data: web::Json<Vec<NackItem>>,
) -> Result<web::Json<Acknowledged>, Error> {
    service.nack(data.into_inner()).await?;

    Ok(web::Json(Acknowledged::new()))
}

#[post("/redirect")]
async fn redirect(
    service: web::Data<Service>,
    data: web::Json<Vec<RedirectItem>>,
) -> Result<web::Json<Acknowledged>, Error> {
    service.redirect(data.into_inner()).await?;

    Ok(web::Json(Acknowledged::new()))
}

#[post("/release")]
async fn release(
    service: web::Data<Service>,
    data: web::Json<Vec<Uuid>>,
) -> Result<web::Json<Acknowledged>, Error> {
    service.release(data.into_inner()).await?;

    Ok(web::Json(Acknowledged::new()))
}

#[derive(Debug, Deserialize)]
pub struct CheckQuery {
    /// Comma separated message ids.
    id: String,
}

#[get("/check")]
async fn check_by_query(
    service: web::Data<Service>,
    query: web::Query<CheckQuery>,
) -> Result<web::Json<Vec<MessageView>>, Error> {
    let ids = split_list(&query.id)
        .map(|id| {
            Uuid::parse_str(id)
                .map_err(|_| Error::invalid_parameter(format!("invalid message id: {id}")))
        })
        .collect::<Result<Vec<_>, _>>()?;

    Ok(web::Json(service.check_messages(&ids).await?))
}

#[post("/check")]
async fn check_by_body(
    service: web::Data<Service>,
    data: web::Json<Vec<Uuid>>,
) -> Result<web::Json<Vec<MessageView>>, Error> {
    Ok(web::Json(service.check_messages(&data).await?))
}

/// Batch endpoints under `/messages`.
pub fn batch_service() -> Scope {
    web::scope("/messages")
        .service(consume)
        .service(ack)
        .service(nack)
        .service(redirect)
        .service(release)
        .service(check_by_query)
        .service(check_by_body)
}
